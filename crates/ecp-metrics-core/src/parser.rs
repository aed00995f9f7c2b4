//! Component directory XML parser.
//!
//! [`parse`] is a pure function: bytes in, [`Document`] or [`ParseError`] out.
//! The XML is first deserialized into private `Raw*` mirrors of the document
//! layout (list wrappers, attributes, text nodes) and only converted into the
//! model once the whole document was accepted, so a failure never yields a
//! partially filled document.

use chrono::{DateTime, Utc};
use quick_xml::NsReader;
use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use serde::Deserialize;

use crate::model::{
    Broker, Certificate, ComponentDirectory, ComponentInfo, Document, Endpoint, Implementation,
    Metadata, NetworkUrl, Path, Restriction,
};

/// Local name of the document root element.
const ROOT_ELEMENT: &[u8] = b"components";

/// Namespace the root element must be bound to.
pub const COMPONENT_DIRECTORY_NS: &str = "http://mades.entsoe.eu/componentDirectory";

/// Error type for document parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("document is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("document is empty")]
    Empty,
    #[error("unexpected root element <{0}>, expected <components>")]
    UnexpectedRoot(String),
    #[error("root element <components> is in namespace {0:?}, expected {expected:?}", expected = COMPONENT_DIRECTORY_NS)]
    UnexpectedNamespace(String),
    #[error("failed reading XML: {0}")]
    Syntax(#[from] quick_xml::Error),
    #[error("failed unmarshaling XML: {0}")]
    Document(#[from] quick_xml::DeError),
}

/// Parses a raw component directory document.
pub fn parse(content: &[u8]) -> Result<Document, ParseError> {
    let text = std::str::from_utf8(content)?;
    let text = text.trim_start_matches('\u{feff}');
    check_root(text)?;
    let raw: RawComponents = quick_xml::de::from_str(text)?;
    Ok(raw.into())
}

/// Rejects documents whose first element is not `<components>` bound to
/// [`COMPONENT_DIRECTORY_NS`], whatever prefix it is bound through.
fn check_root(text: &str) -> Result<(), ParseError> {
    let mut reader = NsReader::from_str(text);
    loop {
        match reader.read_resolved_event()? {
            (ns, Event::Start(e) | Event::Empty(e)) => {
                let name = e.local_name();
                if name.as_ref() != ROOT_ELEMENT {
                    return Err(ParseError::UnexpectedRoot(
                        String::from_utf8_lossy(name.as_ref()).into_owned(),
                    ));
                }
                return match ns {
                    ResolveResult::Bound(Namespace(uri))
                        if uri == COMPONENT_DIRECTORY_NS.as_bytes() =>
                    {
                        Ok(())
                    }
                    ResolveResult::Bound(Namespace(uri)) => Err(ParseError::UnexpectedNamespace(
                        String::from_utf8_lossy(uri).into_owned(),
                    )),
                    ResolveResult::Unbound | ResolveResult::Unknown(_) => {
                        Err(ParseError::UnexpectedNamespace(String::new()))
                    }
                };
            }
            (_, Event::Eof) => return Err(ParseError::Empty),
            _ => {}
        }
    }
}

// ============================================================
// XML layout
// ============================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawComponents {
    #[serde(default)]
    component_list: RawComponentList,
    #[serde(default)]
    metadata: RawMetadata,
}

#[derive(Deserialize, Default)]
struct RawComponentList {
    #[serde(default, rename = "broker")]
    brokers: Vec<RawComponent>,
    #[serde(default, rename = "endpoint")]
    endpoints: Vec<RawComponent>,
    #[serde(default, rename = "componentDirectory")]
    component_directories: Vec<RawComponent>,
}

/// Union of all component variants; variant-only elements default to empty.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawComponent {
    mades_implementation: RawImplementation,
    organization: String,
    #[serde(default)]
    person: String,
    #[serde(default)]
    email: String,
    code: String,
    #[serde(rename = "type")]
    component_type: String,
    #[serde(default)]
    networks: RawNetworks,
    #[serde(default)]
    urls: RawUrls,
    #[serde(default)]
    certificates: RawCertificates,
    creation_timestamp: DateTime<Utc>,
    modification_timestamp: DateTime<Utc>,
    #[serde(default)]
    component_directory: String,
    #[serde(default)]
    restriction: RawRestriction,
    #[serde(default)]
    paths: RawPaths,
}

#[derive(Deserialize)]
struct RawImplementation {
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(rename = "@version")]
    version: String,
    #[serde(rename = "@compatibleVersions", default)]
    compatible_versions: String,
    #[serde(rename = "@madesVersion", default)]
    mades_version: String,
}

#[derive(Deserialize, Default)]
struct RawNetworks {
    #[serde(default)]
    network: Vec<String>,
}

#[derive(Deserialize, Default)]
struct RawUrls {
    #[serde(default)]
    url: Vec<RawUrl>,
}

#[derive(Deserialize)]
struct RawUrl {
    #[serde(rename = "@network", default)]
    network: String,
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Deserialize, Default)]
struct RawCertificates {
    #[serde(default)]
    certificate: Vec<RawCertificate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCertificate {
    #[serde(rename = "certificateID", default)]
    certificate_id: String,
    #[serde(rename = "type", default)]
    certificate_type: String,
    #[serde(default)]
    certificate: String,
    valid_from: DateTime<Utc>,
    valid_to: DateTime<Utc>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawRestriction {
    #[serde(default)]
    components: RawComponentCodes,
    #[serde(default)]
    message_types: RawMessageTypes,
}

#[derive(Deserialize, Default)]
struct RawComponentCodes {
    #[serde(default)]
    component: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawMessageTypes {
    #[serde(default)]
    message_type: Vec<String>,
}

#[derive(Deserialize, Default)]
struct RawPaths {
    #[serde(default)]
    path: Vec<RawPath>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPath {
    #[serde(default)]
    sender_component: RawComponentCodes,
    #[serde(default)]
    message_type: String,
    #[serde(default)]
    path: String,
    valid_from: DateTime<Utc>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawMetadata {
    #[serde(default)]
    component_directory_metadata: RawDirectoryMetadata,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawDirectoryMetadata {
    #[serde(default)]
    component_directory: String,
    #[serde(default)]
    ttl: i64,
    #[serde(rename = "contentID", default)]
    content_id: i64,
}

// ============================================================
// Conversion into the model
// ============================================================

impl From<RawComponents> for Document {
    fn from(raw: RawComponents) -> Self {
        let list = raw.component_list;
        Document {
            brokers: list.brokers.into_iter().map(Broker::from).collect(),
            endpoints: list.endpoints.into_iter().map(Endpoint::from).collect(),
            component_directories: list
                .component_directories
                .into_iter()
                .map(|c| ComponentDirectory { info: c.into_info() })
                .collect(),
            metadata: raw.metadata.component_directory_metadata.into(),
        }
    }
}

impl From<RawComponent> for Broker {
    fn from(mut raw: RawComponent) -> Self {
        let restriction = std::mem::take(&mut raw.restriction);
        Broker {
            info: raw.into_info(),
            restriction: Restriction {
                components: restriction.components.component,
                message_types: restriction.message_types.message_type,
            },
        }
    }
}

impl From<RawComponent> for Endpoint {
    fn from(mut raw: RawComponent) -> Self {
        let paths = std::mem::take(&mut raw.paths);
        Endpoint {
            info: raw.into_info(),
            paths: paths
                .path
                .into_iter()
                .map(|p| Path {
                    sender_components: p.sender_component.component,
                    message_type: p.message_type,
                    path: p.path,
                    valid_from: p.valid_from,
                })
                .collect(),
        }
    }
}

impl RawComponent {
    fn into_info(self) -> ComponentInfo {
        ComponentInfo {
            organization: self.organization,
            person: self.person,
            email: self.email,
            code: self.code,
            component_type: self.component_type,
            networks: self.networks.network,
            urls: self
                .urls
                .url
                .into_iter()
                .map(|u| NetworkUrl {
                    network: u.network,
                    url: u.value,
                })
                .collect(),
            certificates: self
                .certificates
                .certificate
                .into_iter()
                .map(|c| Certificate {
                    id: c.certificate_id,
                    certificate_type: c.certificate_type,
                    material: c.certificate,
                    valid_from: c.valid_from,
                    valid_to: c.valid_to,
                })
                .collect(),
            created_at: self.creation_timestamp,
            modified_at: self.modification_timestamp,
            component_directory: self.component_directory,
            implementation: Implementation {
                name: self.mades_implementation.name,
                version: self.mades_implementation.version,
                compatible_versions: self.mades_implementation.compatible_versions,
                protocol_version: self.mades_implementation.mades_version,
            },
        }
    }
}

impl From<RawDirectoryMetadata> for Metadata {
    fn from(raw: RawDirectoryMetadata) -> Self {
        Metadata {
            component_directory: raw.component_directory,
            ttl: raw.ttl,
            content_id: raw.content_id,
        }
    }
}
