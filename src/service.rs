use std::any::Any;

use crate::buffer::ByteBuf;
use crate::server::ReplySink;

/// A message produced and consumed by the external serialization layer.
/// The runtime never looks inside; it only asks for the packed size and
/// the packed bytes.
pub trait Message: Send {
    /// Exact number of bytes [Message::pack] will append.
    fn packed_size(&self) -> usize;

    /// Append the packed body to `out`, returning the bytes written.
    fn pack(&self, out: &mut ByteBuf) -> usize;

    /// Recover the concrete type on the receiving side.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Unpacks wire payloads into messages for one schema (a method's input or
/// output).
pub trait MessageSchema: Send + Sync {
    fn unpack(&self, payload: &[u8]) -> Result<Box<dyn Message>, ()>;
}

pub struct MethodDescriptor {
    pub input: Box<dyn MessageSchema>,
    pub output: Box<dyn MessageSchema>,
}

/// Method table consumed by both server and client. `method_index` on the
/// wire indexes into `methods`.
#[derive(Default)]
pub struct ServiceDescriptor {
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    #[inline]
    pub fn n_methods(&self) -> usize {
        self.methods.len()
    }

    #[inline]
    pub fn method(&self, index: u32) -> Option<&MethodDescriptor> {
        self.methods.get(index as usize)
    }
}

/// The dispatch entry point supplied by the caller.
///
/// `invoke` runs on the thread driving the connection and must consume
/// `reply` exactly once before returning; this runtime does not support
/// holding the sink for asynchronous completion.
pub trait Service: Send + Sync {
    fn descriptor(&self) -> &ServiceDescriptor;

    fn invoke(&self, method_index: u32, input: Box<dyn Message>, reply: ReplySink<'_>);
}
