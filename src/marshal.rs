//! # Registrar Marshalling
//!
//! The reference to a lookup service travels through unicast discovery as an
//! opaque blob. Its framing on the stream belongs to a [`RegistrarMarshaller`]
//! supplied by the host application; the engine only passes bytes through
//! together with a [`MarshalContext`] describing how the receiving side
//! resolves whatever the blob refers to.

use crate::core::wire::stream;
use crate::error::{DiscoveryError, Result};
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

/// Default upper bound on an incoming registrar blob
pub const DEFAULT_MAX_REGISTRAR_SIZE: usize = 1024 * 1024;

/// Serialized lookup service reference
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RegistrarProxy(Bytes);

impl RegistrarProxy {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        RegistrarProxy(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl fmt::Debug for RegistrarProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegistrarProxy({} bytes)", self.0.len())
    }
}

/// Opaque handle naming a code-loading context.
///
/// Also keys the facade cache, so facades built for different contexts never mix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoaderId(Arc<str>);

impl LoaderId {
    pub fn new(name: &str) -> Self {
        LoaderId(Arc::from(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Default for LoaderId {
    fn default() -> Self {
        LoaderId::new("default")
    }
}

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Writes and reads registrar blobs on a unicast stream
pub trait RegistrarMarshaller: Send + Sync {
    fn write_registrar(&self, registrar: &RegistrarProxy, out: &mut dyn Write) -> Result<()>;

    fn read_registrar(&self, input: &mut dyn Read, ctx: &MarshalContext) -> Result<RegistrarProxy>;
}

/// `u32` big-endian length followed by the blob
#[derive(Debug, Clone, Copy)]
pub struct FramedMarshaller {
    max_len: usize,
}

impl FramedMarshaller {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Default for FramedMarshaller {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REGISTRAR_SIZE)
    }
}

impl RegistrarMarshaller for FramedMarshaller {
    fn write_registrar(&self, registrar: &RegistrarProxy, out: &mut dyn Write) -> Result<()> {
        let len = registrar.as_bytes().len();
        if len > self.max_len || len > u32::MAX as usize {
            return Err(DiscoveryError::ItemTooLong {
                kind: "registrar",
                len,
                capacity: self.max_len,
            });
        }
        out.write_all(&(len as u32).to_be_bytes())?;
        out.write_all(registrar.as_bytes())?;
        Ok(())
    }

    fn read_registrar(&self, input: &mut dyn Read, _ctx: &MarshalContext) -> Result<RegistrarProxy> {
        let len = u32::from_be_bytes(stream::read_array(input)?) as usize;
        if len > self.max_len {
            return Err(DiscoveryError::malformed(format!(
                "registrar of {len} bytes exceeds limit of {}",
                self.max_len
            )));
        }
        Ok(RegistrarProxy::new(stream::read_vec(input, len)?))
    }
}

/// Everything the receiving side needs to make sense of a registrar blob
#[derive(Clone)]
pub struct MarshalContext {
    marshaller: Arc<dyn RegistrarMarshaller>,
    default_loader: Option<LoaderId>,
    verifier_loader: Option<LoaderId>,
    extra: Vec<Arc<dyn Any + Send + Sync>>,
}

impl MarshalContext {
    pub fn new(marshaller: Arc<dyn RegistrarMarshaller>) -> Self {
        Self {
            marshaller,
            default_loader: None,
            verifier_loader: None,
            extra: Vec::new(),
        }
    }

    pub fn with_default_loader(mut self, loader: LoaderId) -> Self {
        self.default_loader = Some(loader);
        self
    }

    pub fn with_verifier_loader(mut self, loader: LoaderId) -> Self {
        self.verifier_loader = Some(loader);
        self
    }

    pub fn with_context_object(mut self, object: Arc<dyn Any + Send + Sync>) -> Self {
        self.extra.push(object);
        self
    }

    pub fn marshaller(&self) -> &dyn RegistrarMarshaller {
        self.marshaller.as_ref()
    }

    pub fn default_loader(&self) -> Option<&LoaderId> {
        self.default_loader.as_ref()
    }

    pub fn verifier_loader(&self) -> Option<&LoaderId> {
        self.verifier_loader.as_ref()
    }

    /// First auxiliary context object of type `T`
    pub fn context_object<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.extra.iter().find_map(|o| o.downcast_ref::<T>())
    }
}

impl Default for MarshalContext {
    fn default() -> Self {
        Self::new(Arc::new(FramedMarshaller::default()))
    }
}

impl fmt::Debug for MarshalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarshalContext")
            .field("default_loader", &self.default_loader)
            .field("verifier_loader", &self.verifier_loader)
            .field("extra", &self.extra.len())
            .finish()
    }
}
