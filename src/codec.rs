use std::any::Any;
use std::fmt::Display;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::buffer::ByteBuf;
use crate::service::{Message, MessageSchema};

/// The codec is immutable, if need changing (like setting up cipher),
/// should have inner mutability.
pub trait Codec: Default + Send + Sync + 'static {
    fn encode<T: Serialize + Display>(&self, msg: &T) -> Result<Vec<u8>, ()>;

    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()>;
}

#[derive(Default)]
pub struct MsgpCodec();

impl Codec for MsgpCodec {
    #[inline(always)]
    fn encode<T: Serialize + Display>(&self, msg: &T) -> Result<Vec<u8>, ()> {
        match rmp_serde::encode::to_vec_named(msg) {
            Ok(buf) => Ok(buf),
            Err(e) => {
                error!("{} encode error: {:?}", msg, e);
                Err(())
            }
        }
    }

    #[inline(always)]
    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()> {
        match rmp_serde::decode::from_slice::<T>(buf) {
            Err(e) => {
                warn!("decode error: {:?}", e);
                Err(())
            }
            Ok(msg) => Ok(msg),
        }
    }
}

/// A serde value pre-packed by a [Codec], carried through the type-erased
/// message contract.
pub struct CodecMessage<T> {
    pub value: T,
    packed: Vec<u8>,
}

impl<T: Serialize + Display> CodecMessage<T> {
    pub fn new<C: Codec>(codec: &C, value: T) -> Result<Self, ()> {
        let packed = codec.encode(&value)?;
        Ok(Self { value, packed })
    }
}

impl<T: Send + 'static> Message for CodecMessage<T> {
    #[inline]
    fn packed_size(&self) -> usize {
        self.packed.len()
    }

    #[inline]
    fn pack(&self, out: &mut ByteBuf) -> usize {
        out.append(&self.packed);
        self.packed.len()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Schema for `T` under codec `C`. An empty payload decodes to
/// `T::default()`, matching schema layers that unpack a zero-length body
/// into a default message.
pub struct CodecSchema<T, C: Codec> {
    codec: C,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C: Codec> CodecSchema<T, C> {
    pub fn new() -> Self {
        Self { codec: C::default(), _marker: PhantomData }
    }
}

impl<T, C: Codec> Default for CodecSchema<T, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, C> MessageSchema for CodecSchema<T, C>
where
    T: Serialize + DeserializeOwned + Default + Display + Send + 'static,
    C: Codec,
{
    fn unpack(&self, payload: &[u8]) -> Result<Box<dyn Message>, ()> {
        if payload.is_empty() {
            let value = T::default();
            let packed = self.codec.encode(&value)?;
            return Ok(Box::new(CodecMessage { value, packed }));
        }
        let value: T = self.codec.decode(payload)?;
        Ok(Box::new(CodecMessage { value, packed: payload.to_vec() }))
    }
}
