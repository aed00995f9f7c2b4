//! Component directory document model.
//!
//! A [`Document`] is the typed form of the XML directory published by the
//! component directory. It is built only by [`crate::parser::parse`] and never
//! mutated afterwards; consumers share it through `Arc<Document>`.

use chrono::{DateTime, Utc};

/// Parsed component directory snapshot.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Document {
    /// Source: `componentList/broker`
    pub brokers: Vec<Broker>,
    /// Source: `componentList/endpoint`
    pub endpoints: Vec<Endpoint>,
    /// Source: `componentList/componentDirectory`
    pub component_directories: Vec<ComponentDirectory>,
    /// Source: `metadata/componentDirectoryMetadata`
    pub metadata: Metadata,
}

impl Document {
    /// Iterates over the shared part of every component: brokers first, then
    /// endpoints, then component directories, each in document order.
    pub fn components(&self) -> impl Iterator<Item = &ComponentInfo> {
        self.brokers
            .iter()
            .map(Component::info)
            .chain(self.endpoints.iter().map(Component::info))
            .chain(self.component_directories.iter().map(Component::info))
    }

    /// Total number of components across all three collections.
    pub fn component_count(&self) -> usize {
        self.brokers.len() + self.endpoints.len() + self.component_directories.len()
    }
}

/// Directory-level metadata.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Metadata {
    /// Code of the component directory that issued the document.
    pub component_directory: String,
    /// Time-to-live declared by the directory.
    pub ttl: i64,
    /// Monotonic content identifier of this directory revision.
    pub content_id: i64,
}

/// Shared access to the fields every component variant carries.
pub trait Component {
    fn info(&self) -> &ComponentInfo;
}

/// Fields common to brokers, endpoints and component directories.
#[derive(Clone, Debug, PartialEq)]
pub struct ComponentInfo {
    pub organization: String,
    /// Contact person.
    pub person: String,
    pub email: String,
    /// Component code. Not guaranteed to be unique within a document.
    pub code: String,
    /// Free-form type tag, e.g. `BROKER` or `ENDPOINT`.
    pub component_type: String,
    pub networks: Vec<String>,
    pub urls: Vec<NetworkUrl>,
    pub certificates: Vec<Certificate>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Code of the component directory the component is registered with.
    pub component_directory: String,
    pub implementation: Implementation,
}

/// A URL under which a component is reachable in one network.
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkUrl {
    pub network: String,
    pub url: String,
}

/// Certificate entry. Validity is carried as declared, never checked.
#[derive(Clone, Debug, PartialEq)]
pub struct Certificate {
    pub id: String,
    pub certificate_type: String,
    /// Opaque certificate material.
    pub material: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
}

/// Software implementation running the component.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Implementation {
    pub name: String,
    pub version: String,
    pub compatible_versions: String,
    /// MADES protocol version.
    pub protocol_version: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Broker {
    pub info: ComponentInfo,
    pub restriction: Restriction,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Endpoint {
    pub info: ComponentInfo,
    pub paths: Vec<Path>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComponentDirectory {
    pub info: ComponentInfo,
}

/// Allow-list a broker declares for relayed traffic.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Restriction {
    pub components: Vec<String>,
    pub message_types: Vec<String>,
}

/// Routing rule of an endpoint for a sender / message type pair.
#[derive(Clone, Debug, PartialEq)]
pub struct Path {
    pub sender_components: Vec<String>,
    pub message_type: String,
    pub path: String,
    pub valid_from: DateTime<Utc>,
}

impl Component for Broker {
    fn info(&self) -> &ComponentInfo {
        &self.info
    }
}

impl Component for Endpoint {
    fn info(&self) -> &ComponentInfo {
        &self.info
    }
}

impl Component for ComponentDirectory {
    fn info(&self) -> &ComponentInfo {
        &self.info
    }
}
