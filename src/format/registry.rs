use super::{
    DiscoveryFormat, FormatId, FormatProvider, MulticastAnnouncementDecoder,
    MulticastAnnouncementEncoder, MulticastRequestDecoder, MulticastRequestEncoder,
    UnicastDiscoveryClient, UnicastDiscoveryServer,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Providers of one role keyed by format identifier, in registration order
pub struct FormatTable<P: ?Sized> {
    entries: Vec<(FormatId, Arc<P>)>,
}

impl<P: ?Sized> Default for FormatTable<P> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<P: ?Sized + DiscoveryFormat> FormatTable<P> {
    /// First registration of an identifier wins; later ones are dropped.
    fn insert(&mut self, provider: Arc<P>, role: &'static str) {
        let name = provider.format_name().to_owned();
        let id = FormatId::from_name(&name);
        if id.is_none() {
            warn!(format = %name, role, "Dropping format whose identifier is reserved");
            return;
        }
        if let Some((_, existing)) = self.entries.iter().find(|(known, _)| *known == id) {
            warn!(
                format = %name,
                existing = %existing.format_name(),
                format_id = %id,
                role,
                "Format identifier collision, dropping later provider"
            );
            return;
        }
        debug!(format = %name, format_id = %id, role, "Registered discovery format");
        self.entries.push((id, provider));
    }

    pub fn get(&self, id: FormatId) -> Option<&Arc<P>> {
        self.entries
            .iter()
            .find(|(known, _)| *known == id)
            .map(|(_, p)| p)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FormatId, &Arc<P>)> {
        self.entries.iter().map(|(id, p)| (*id, p))
    }

    pub fn ids(&self) -> impl Iterator<Item = FormatId> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(_, p)| p.format_name().to_owned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Generation-2 providers grouped by role.
///
/// Built once from an ordered provider list; unicast clients propose formats
/// in this order.
#[derive(Default)]
pub struct FormatRegistry {
    request_encoders: FormatTable<dyn MulticastRequestEncoder>,
    request_decoders: FormatTable<dyn MulticastRequestDecoder>,
    announcement_encoders: FormatTable<dyn MulticastAnnouncementEncoder>,
    announcement_decoders: FormatTable<dyn MulticastAnnouncementDecoder>,
    unicast_clients: FormatTable<dyn UnicastDiscoveryClient>,
    unicast_servers: FormatTable<dyn UnicastDiscoveryServer>,
}

impl FormatRegistry {
    pub fn new(providers: impl IntoIterator<Item = FormatProvider>) -> Self {
        let mut registry = Self::default();
        for provider in providers {
            let role = provider.role();
            match provider {
                FormatProvider::RequestEncoder(p) => registry.request_encoders.insert(p, role),
                FormatProvider::RequestDecoder(p) => registry.request_decoders.insert(p, role),
                FormatProvider::AnnouncementEncoder(p) => {
                    registry.announcement_encoders.insert(p, role)
                }
                FormatProvider::AnnouncementDecoder(p) => {
                    registry.announcement_decoders.insert(p, role)
                }
                FormatProvider::UnicastClient(p) => registry.unicast_clients.insert(p, role),
                FormatProvider::UnicastServer(p) => registry.unicast_servers.insert(p, role),
            }
        }
        registry
    }

    pub fn request_encoders(&self) -> &FormatTable<dyn MulticastRequestEncoder> {
        &self.request_encoders
    }

    pub fn request_decoders(&self) -> &FormatTable<dyn MulticastRequestDecoder> {
        &self.request_decoders
    }

    pub fn announcement_encoders(&self) -> &FormatTable<dyn MulticastAnnouncementEncoder> {
        &self.announcement_encoders
    }

    pub fn announcement_decoders(&self) -> &FormatTable<dyn MulticastAnnouncementDecoder> {
        &self.announcement_decoders
    }

    pub fn unicast_clients(&self) -> &FormatTable<dyn UnicastDiscoveryClient> {
        &self.unicast_clients
    }

    pub fn unicast_servers(&self) -> &FormatTable<dyn UnicastDiscoveryServer> {
        &self.unicast_servers
    }
}

impl fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatRegistry")
            .field("request_encoders", &self.request_encoders.names())
            .field("request_decoders", &self.request_decoders.names())
            .field("announcement_encoders", &self.announcement_encoders.names())
            .field("announcement_decoders", &self.announcement_decoders.names())
            .field("unicast_clients", &self.unicast_clients.names())
            .field("unicast_servers", &self.unicast_servers.names())
            .finish()
    }
}
