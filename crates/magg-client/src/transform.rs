//! Transformations between MCP result shapes
//!
//! The proxy tool returns every query result as one embedded resource with
//! a JSON payload and proxy annotations. These helpers build and unpack
//! that shape, and repackage resource/prompt results as tool results.

use crate::types::{Annotations, Content, GetPromptResult, ResourceContents};
use serde_json::Value;

pub const JSON_MIME: &str = "application/json";

/// Proxy annotation fields attached to a result.
#[derive(Debug, Clone, Default)]
pub struct ProxyAnnotations<'a> {
    pub action: &'a str,
    pub a_type: &'a str,
    pub path: Option<&'a str>,
}

fn annotations_for(info: &ProxyAnnotations<'_>, type_name: Option<&str>, many: Option<bool>) -> Annotations {
    Annotations {
        proxy_type: Some(info.a_type.to_string()),
        proxy_action: Some(info.action.to_string()),
        proxy_path: info.path.map(String::from),
        python_type: type_name.map(String::from),
        many,
        mime_type: type_name.map(|_| JSON_MIME.to_string()),
        extra: Default::default(),
    }
}

/// Embed a serialized object in a JSON resource, annotated for decoding.
pub fn embed_object(value: &Value, type_name: &str, uri: String, info: ProxyAnnotations<'_>) -> Content {
    Content::Resource {
        resource: ResourceContents::text(
            uri,
            JSON_MIME,
            serde_json::to_string(value).unwrap_or_else(|_| "null".to_string()),
        ),
        annotations: Some(annotations_for(&info, Some(type_name), None)),
    }
}

/// Embed a serialized list in a JSON resource, annotated `many`.
pub fn embed_object_list(values: &Value, type_name: &str, uri: String, info: ProxyAnnotations<'_>) -> Content {
    Content::Resource {
        resource: ResourceContents::text(
            uri,
            JSON_MIME,
            serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string()),
        ),
        annotations: Some(annotations_for(&info, Some(type_name), Some(true))),
    }
}

/// Check whether a content item carries a JSON payload.
pub fn is_json_typed(content: &Content) -> bool {
    match content {
        Content::Resource { resource, .. } => {
            resource.is_json()
                || content
                    .annotations()
                    .map_or(false, |a| a.mime_type.as_deref() == Some(JSON_MIME))
        }
        Content::Text { .. } => content
            .annotations()
            .map_or(false, |a| a.mime_type.as_deref() == Some(JSON_MIME)),
        Content::Image { .. } => false,
    }
}

/// Extract the embedded object payload: `(annotations, raw_json, many)`.
///
/// Present only when the item is an annotated JSON embedding produced by
/// the proxy (a `pythonType` label plus JSON content).
pub fn get_embedded_object(content: &Content) -> Option<(&Annotations, &str, bool)> {
    let annotations = content.annotations()?;
    annotations.python_type.as_ref()?;

    if !is_json_typed(content) {
        return None;
    }

    let json = content.as_text()?;
    Some((annotations, json, annotations.many.unwrap_or(false)))
}

/// Add proxy annotations onto an existing content item in place.
pub fn annotate_content(mut content: Content, info: ProxyAnnotations<'_>) -> Content {
    let slot = content.annotations_mut();
    let mut annotations = slot.take().unwrap_or_default();
    annotations.proxy_type = Some(info.a_type.to_string());
    annotations.proxy_action = Some(info.action.to_string());
    annotations.proxy_path = info.path.map(String::from);
    *slot = Some(annotations);
    content
}

/// Repackage one read-resource content item as a tool result.
///
/// Text that decodes as JSON is normalized to `application/json`, with the
/// original mime type preserved in a `contentType` annotation key.
pub fn resource_result_as_tool_result(data: ResourceContents, info: ProxyAnnotations<'_>) -> Content {
    let mut annotations = annotations_for(&info, None, None);

    let resource = match (&data.text, data.is_json()) {
        (Some(text), false) => {
            if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                if let Some(original) = &data.mime_type {
                    annotations
                        .extra
                        .insert("contentType".to_string(), Value::String(original.clone()));
                }
                ResourceContents {
                    uri: data.uri.clone(),
                    mime_type: Some(JSON_MIME.to_string()),
                    text: Some(serde_json::to_string(&parsed).unwrap_or_else(|_| text.clone())),
                    blob: None,
                }
            } else {
                data
            }
        }
        _ => data,
    };

    Content::Resource {
        resource,
        annotations: Some(annotations),
    }
}

/// Extract the original resource contents from a proxied tool result.
pub fn tool_result_as_resource_result(content: &Content) -> Option<ResourceContents> {
    match content {
        Content::Resource {
            resource,
            annotations,
        } if annotations
            .as_ref()
            .map_or(false, |a| a.proxy_type.as_deref() == Some("resource")) =>
        {
            Some(resource.clone())
        }
        _ => None,
    }
}

/// Package a prompt result as a single annotated tool result.
pub fn prompt_result_as_tool_result(result: &GetPromptResult, name: &str) -> Content {
    let uri = if name.contains("://") {
        name.to_string()
    } else {
        format!("urn:prompt:{}", name)
    };
    let value = serde_json::to_value(result).unwrap_or(Value::Null);
    embed_object(
        &value,
        "GetPromptResult",
        uri,
        ProxyAnnotations {
            action: "call",
            a_type: "prompt",
            path: Some(name),
        },
    )
}

/// Extract a prompt result from a proxied tool result.
pub fn tool_result_as_prompt_result(content: &Content) -> Option<GetPromptResult> {
    let (annotations, json, _many) = get_embedded_object(content)?;
    if annotations.proxy_type.as_deref() != Some("prompt") {
        return None;
    }
    serde_json::from_str(json).ok()
}
