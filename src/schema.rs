//! Loading and parsing of the server's self-description documents.
//!
//! ARI describes itself with a root `resources.json` listing one document
//! per resource namespace. Each resource document carries an `apis` array
//! whose entries hold the REST `operations`; the `events` document
//! additionally carries `models` describing every event the server can
//! push. The loader fetches all of them, rewrites the server's
//! self-reported hostname to the configured one, and produces an immutable
//! [`Catalog`] plus [`EventSchema`].

use std::collections::HashMap;

use futures_util::future::try_join_all;
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::constants::{EVENTS_RESOURCE, RESOURCES_DOC};
use crate::error::{AriError, AriResult};
use crate::http::HttpInvoker;

/// Where an operation parameter is placed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamPlacement {
    /// Substituted into the path template.
    Path,
    /// Appended as a query string pair.
    Query,
    /// Serialized into the JSON request body.
    Body,
    /// Sent as a form field.
    Form,
    /// Sent as an HTTP header.
    Header,
}

impl ParamPlacement {
    /// Parse the wire placement name. Unknown placements are treated as
    /// query parameters.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "path" => ParamPlacement::Path,
            "query" => ParamPlacement::Query,
            "body" => ParamPlacement::Body,
            "form" => ParamPlacement::Form,
            "header" => ParamPlacement::Header,
            _ => ParamPlacement::Query,
        }
    }
}

/// One declared parameter of an operation.
#[derive(Debug, Clone)]
pub struct ParameterDescriptor {
    /// Declared parameter name.
    pub name: String,
    /// Where the value is placed on the wire.
    pub placement: ParamPlacement,
    /// Whether the binder rejects option maps lacking this parameter.
    pub required: bool,
    /// Whether the declared type is a list.
    pub allow_multiple: bool,
    /// Declared scalar or model type name.
    pub data_type: String,
    /// Human-readable description from the document.
    pub description: Option<String>,
}

/// One callable operation on a resource namespace.
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    /// HTTP method (`GET`, `POST`, ...).
    pub method: String,
    /// Full path template including the API base path, with `{placeholders}`.
    pub path: String,
    /// Declared parameters, in document order.
    pub parameters: Vec<ParameterDescriptor>,
    /// Declared response model name, absent for `void` operations.
    pub response_type: Option<String>,
    /// Operation summary from the document.
    pub summary: Option<String>,
}

/// All operations of one resource namespace.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    name: String,
    operations: HashMap<String, OperationDescriptor>,
}

impl ResourceDescriptor {
    /// Namespace name (`channels`, `bridges`, ...).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up an operation by its nickname.
    pub fn operation(&self, name: &str) -> Option<&OperationDescriptor> {
        self.operations.get(name)
    }

    /// Sorted operation nicknames.
    pub fn operation_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// The loaded operation catalog. Immutable after load.
#[derive(Debug, Default)]
pub struct Catalog {
    resources: HashMap<String, ResourceDescriptor>,
}

impl Catalog {
    /// Look up a resource namespace by name.
    pub fn resource(&self, name: &str) -> Option<&ResourceDescriptor> {
        self.resources.get(name)
    }

    /// Sorted namespace names.
    pub fn resource_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.resources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of loaded namespaces.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// One field of an event model.
#[derive(Debug, Clone)]
pub struct EventField {
    /// Payload field name.
    pub name: String,
    /// Declared type name. Fields naming a resource kind are promotable.
    pub data_type: String,
    /// Human-readable description from the document.
    pub description: Option<String>,
}

/// One event model: its fields in document order.
#[derive(Debug, Clone)]
pub struct EventDescriptor {
    /// Event name as carried in the payload `type` field.
    pub name: String,
    /// Declared fields, in document order.
    pub fields: Vec<EventField>,
}

/// The loaded event model. Immutable after load.
#[derive(Debug, Default)]
pub struct EventSchema {
    events: HashMap<String, EventDescriptor>,
}

impl EventSchema {
    /// Look up an event model by name.
    pub fn event(&self, name: &str) -> Option<&EventDescriptor> {
        self.events.get(name)
    }

    /// Sorted event names.
    pub fn event_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.events.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Fetch and parse the full self-description from the server.
///
/// Pure with respect to its inputs: no sockets stay open and no listeners
/// are installed. Reachability failures surface as
/// [`AriError::HostIsNotReachable`], malformed documents as
/// [`AriError::SchemaInvalid`].
pub(crate) async fn load(http: &HttpInvoker, base: &Url) -> AriResult<(Catalog, EventSchema)> {
    let root_url = join_relative(base, RESOURCES_DOC)?;
    debug!("fetching resource listing from {}", root_url);
    let root = http.get_json(&root_url).await.map_err(as_load_error)?;

    let docs = resource_doc_paths(&root)?;
    let fetches = docs.iter().map(|(_, path)| {
        let url = join_relative(base, path.trim_start_matches('/'));
        async move { http.get_json(&url?).await.map_err(as_load_error) }
    });
    let bodies = try_join_all(fetches).await?;

    let mut catalog = Catalog::default();
    let mut events = None;
    for ((name, _), body) in docs.iter().zip(&bodies) {
        let descriptor = parse_resource_doc(name, body, base)?;
        debug!(
            "loaded {} operations for namespace {}",
            descriptor.operations.len(),
            name
        );
        if name == EVENTS_RESOURCE {
            events = Some(parse_events_doc(body)?);
        }
        catalog.resources.insert(name.clone(), descriptor);
    }

    let events = events.ok_or_else(|| AriError::schema("events document missing from listing"))?;
    info!(
        "loaded {} resource namespaces and {} event models",
        catalog.len(),
        events.events.len()
    );
    Ok((catalog, events))
}

/// Reachability and decode failures during schema load fold into the
/// connect-time taxonomy.
fn as_load_error(err: AriError) -> AriError {
    match err {
        AriError::TransportError { message } => AriError::HostIsNotReachable { message },
        AriError::Json(e) => AriError::schema(format!("malformed document: {}", e)),
        other => other,
    }
}

fn join_relative(base: &Url, path: &str) -> AriResult<Url> {
    let mut joined = base.clone();
    {
        let mut segments = joined
            .path_segments_mut()
            .map_err(|_| AriError::schema("base url cannot be a base"))?;
        segments.pop_if_empty();
        for segment in path.split('/') {
            segments.push(segment);
        }
    }
    Ok(joined)
}

/// Extract `(name, path)` pairs for every resource document in the root
/// listing. The `{format}` placeholder is resolved to `json`.
pub(crate) fn resource_doc_paths(root: &Value) -> AriResult<Vec<(String, String)>> {
    let apis = root
        .get("apis")
        .and_then(Value::as_array)
        .ok_or_else(|| AriError::schema("resources document has no apis array"))?;

    let mut docs = Vec::with_capacity(apis.len());
    for api in apis {
        let path = api
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| AriError::schema("resource listing entry has no path"))?;
        let path = path.replace("{format}", "json");
        let name = path
            .rsplit('/')
            .next()
            .and_then(|file| file.strip_suffix(".json"))
            .ok_or_else(|| AriError::schema(format!("unrecognized resource doc path: {}", path)))?
            .to_string();
        docs.push((name, path));
    }
    Ok(docs)
}

/// Parse one resource document into a [`ResourceDescriptor`].
///
/// The document's `basePath` names the server's own idea of its address;
/// only its path part is kept and the configured `base` host is used for
/// all operation URLs.
pub(crate) fn parse_resource_doc(
    name: &str,
    doc: &Value,
    base: &Url,
) -> AriResult<ResourceDescriptor> {
    let prefix = match doc.get("basePath").and_then(Value::as_str) {
        Some(base_path) => Url::parse(base_path)
            .map(|u| u.path().trim_end_matches('/').to_string())
            .map_err(|_| AriError::schema(format!("{}: unparseable basePath", name)))?,
        None => base.path().trim_end_matches('/').to_string(),
    };

    let apis = doc
        .get("apis")
        .and_then(Value::as_array)
        .ok_or_else(|| AriError::schema(format!("{} document has no apis array", name)))?;

    let mut operations = HashMap::new();
    for api in apis {
        let path = api
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| AriError::schema(format!("{}: api entry has no path", name)))?;
        let Some(ops) = api.get("operations").and_then(Value::as_array) else {
            continue;
        };
        for op in ops {
            let nickname = op
                .get("nickname")
                .and_then(Value::as_str)
                .ok_or_else(|| AriError::schema(format!("{}: operation has no nickname", name)))?;
            let method = op
                .get("httpMethod")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    AriError::schema(format!("{}.{}: operation has no httpMethod", name, nickname))
                })?;

            let parameters = match op.get("parameters").and_then(Value::as_array) {
                Some(params) => params
                    .iter()
                    .map(|p| parse_parameter(name, nickname, p))
                    .collect::<AriResult<Vec<_>>>()?,
                None => Vec::new(),
            };

            let response_type = op
                .get("responseClass")
                .and_then(Value::as_str)
                .filter(|t| *t != "void")
                .map(str::to_string);

            operations.insert(
                nickname.to_string(),
                OperationDescriptor {
                    method: method.to_string(),
                    path: format!("{}{}", prefix, path),
                    parameters,
                    response_type,
                    summary: op
                        .get("summary")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                },
            );
        }
    }

    Ok(ResourceDescriptor {
        name: name.to_string(),
        operations,
    })
}

fn parse_parameter(resource: &str, op: &str, param: &Value) -> AriResult<ParameterDescriptor> {
    let name = param
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| AriError::schema(format!("{}.{}: parameter has no name", resource, op)))?;
    Ok(ParameterDescriptor {
        name: name.to_string(),
        placement: ParamPlacement::from_wire(
            param.get("paramType").and_then(Value::as_str).unwrap_or(""),
        ),
        required: param
            .get("required")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        allow_multiple: param
            .get("allowMultiple")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        data_type: param
            .get("dataType")
            .and_then(Value::as_str)
            .unwrap_or("string")
            .to_string(),
        description: param
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Parse the event model out of the `events` resource document.
pub(crate) fn parse_events_doc(doc: &Value) -> AriResult<EventSchema> {
    let models = doc
        .get("models")
        .and_then(Value::as_object)
        .ok_or_else(|| AriError::schema("events document has no models"))?;

    let mut events = HashMap::new();
    for (name, model) in models {
        let mut fields = Vec::new();
        if let Some(properties) = model.get("properties").and_then(Value::as_object) {
            for (field_name, property) in properties {
                fields.push(EventField {
                    name: field_name.clone(),
                    data_type: property
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("string")
                        .to_string(),
                    description: property
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }
        }
        events.insert(
            name.clone(),
            EventDescriptor {
                name: name.clone(),
                fields,
            },
        );
    }

    Ok(EventSchema { events })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Url {
        Url::parse("http://pbx.example.com:8088/ari").unwrap()
    }

    #[test]
    fn test_resource_doc_paths() {
        let root = json!({
            "apiVersion": "2.0.0",
            "apis": [
                {"path": "/api-docs/channels.{format}", "description": "Channel resources"},
                {"path": "/api-docs/bridges.{format}", "description": "Bridge resources"},
                {"path": "/api-docs/events.{format}", "description": "WebSocket resource"}
            ]
        });

        let docs = resource_doc_paths(&root).unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].0, "channels");
        assert_eq!(docs[0].1, "/api-docs/channels.json");
        assert_eq!(docs[2].0, "events");
    }

    #[test]
    fn test_resource_doc_paths_missing_apis() {
        let err = resource_doc_paths(&json!({"apiVersion": "2.0.0"})).unwrap_err();
        assert!(matches!(err, AriError::SchemaInvalid { .. }));
    }

    #[test]
    fn test_parse_resource_doc_rewrites_host() {
        let doc = json!({
            "basePath": "http://localhost:8088/ari",
            "apis": [{
                "path": "/channels/{channelId}",
                "operations": [{
                    "httpMethod": "GET",
                    "nickname": "get",
                    "responseClass": "Channel",
                    "summary": "Channel details.",
                    "parameters": [{
                        "name": "channelId",
                        "paramType": "path",
                        "required": true,
                        "allowMultiple": false,
                        "dataType": "string"
                    }]
                }]
            }]
        });

        let descriptor = parse_resource_doc("channels", &doc, &base()).unwrap();
        let op = descriptor.operation("get").unwrap();
        // The path keeps only the document's path prefix; the configured
        // host replaces the server's self-reported localhost.
        assert_eq!(op.path, "/ari/channels/{channelId}");
        assert_eq!(op.method, "GET");
        assert_eq!(op.response_type.as_deref(), Some("Channel"));
        assert_eq!(op.parameters.len(), 1);
        assert_eq!(op.parameters[0].placement, ParamPlacement::Path);
        assert!(op.parameters[0].required);
    }

    #[test]
    fn test_parse_resource_doc_void_response() {
        let doc = json!({
            "basePath": "http://localhost:8088/ari",
            "apis": [{
                "path": "/channels/{channelId}",
                "operations": [{
                    "httpMethod": "DELETE",
                    "nickname": "hangup",
                    "responseClass": "void",
                    "parameters": []
                }]
            }]
        });

        let descriptor = parse_resource_doc("channels", &doc, &base()).unwrap();
        assert!(descriptor.operation("hangup").unwrap().response_type.is_none());
    }

    #[test]
    fn test_parse_resource_doc_missing_apis() {
        let err = parse_resource_doc("channels", &json!({}), &base()).unwrap_err();
        assert!(matches!(err, AriError::SchemaInvalid { .. }));
    }

    #[test]
    fn test_unknown_placement_becomes_query() {
        assert_eq!(ParamPlacement::from_wire("matrix"), ParamPlacement::Query);
        assert_eq!(ParamPlacement::from_wire("path"), ParamPlacement::Path);
        assert_eq!(ParamPlacement::from_wire("body"), ParamPlacement::Body);
    }

    #[test]
    fn test_parse_events_doc() {
        let doc = json!({
            "models": {
                "PlaybackFinished": {
                    "id": "PlaybackFinished",
                    "properties": {
                        "playback": {"type": "Playback", "required": true, "description": "Playback control object"}
                    }
                },
                "ChannelDtmfReceived": {
                    "id": "ChannelDtmfReceived",
                    "properties": {
                        "digit": {"type": "string", "required": true},
                        "channel": {"type": "Channel", "required": true}
                    }
                }
            }
        });

        let schema = parse_events_doc(&doc).unwrap();
        let model = schema.event("ChannelDtmfReceived").unwrap();
        assert_eq!(model.fields.len(), 2);
        // Document order is preserved.
        assert_eq!(model.fields[0].name, "digit");
        assert_eq!(model.fields[1].name, "channel");
        assert_eq!(model.fields[1].data_type, "Channel");
        assert!(schema.event("NoSuchEvent").is_none());
    }

    #[test]
    fn test_parse_events_doc_missing_models() {
        let err = parse_events_doc(&json!({"apis": []})).unwrap_err();
        assert!(matches!(err, AriError::SchemaInvalid { .. }));
    }
}
