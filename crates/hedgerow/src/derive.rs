// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Derivation of per-attempt contexts.
//!
//! Every attempt of a hedged request runs in a child context derived from
//! the caller's context: a fresh request id, a freshly selected endpoint
//! (except for the initial attempt), and a child log wired so the parent's
//! log properties flow down as they become available.

use hedgerow_transport::{ClientRequestContext, HttpRequest, RequestLogProperty, RpcRequest};

/// Derives a child context for one attempt, replacing the requests.
///
/// When the parent has an endpoint group and this is not the initial
/// attempt, a new endpoint is selected.
pub(crate) fn derive_context(
    parent: &ClientRequestContext,
    http_request: Option<HttpRequest>,
    rpc_request: Option<RpcRequest>,
    initial_attempt: bool,
) -> ClientRequestContext {
    let id = parent.next_request_id();
    let endpoint = match parent.endpoint_group() {
        Some(group) if !initial_attempt => Some(group.select_now()),
        _ => parent.endpoint(),
    };
    let derived = parent.new_derived_context(id, http_request, rpc_request, endpoint);

    // The derived log becomes a child of the parent log, and the properties
    // the parent already knows, or will learn, are copied down.
    let parent_log = parent.log();
    let derived_log = derived.log_builder();

    derived_log.serialization_format(parent_log.serialization_format());
    if parent_log.is_available(RequestLogProperty::Name) {
        if let Some(name) = parent_log.name() {
            match parent_log.service_name() {
                Some(service_name) => derived_log.name_with_service(service_name, name),
                None => derived_log.name(name),
            }
        }
    }

    if parent_log.is_deferred(RequestLogProperty::RequestContent) {
        derived_log.defer(RequestLogProperty::RequestContent);
    }
    {
        let derived_log = derived.log_builder();
        parent_log.on_available(RequestLogProperty::RequestContent, move |parent_log| {
            if let Some(content) = parent_log.request_content() {
                derived_log.request_content(content);
            }
        });
    }

    if parent_log.is_deferred(RequestLogProperty::RequestContentPreview) {
        derived_log.defer(RequestLogProperty::RequestContentPreview);
    }
    {
        let derived_log = derived.log_builder();
        parent_log.on_available(RequestLogProperty::RequestContentPreview, move |parent_log| {
            if let Some(preview) = parent_log.request_content_preview() {
                derived_log.request_content_preview(preview);
            }
        });
    }

    // Response content flows down only when the parent deferred it.
    if parent_log.is_deferred(RequestLogProperty::ResponseContent) {
        derived_log.defer(RequestLogProperty::ResponseContent);
        let derived_log = derived.log_builder();
        parent_log.on_available(RequestLogProperty::ResponseContent, move |parent_log| {
            if let Some(content) = parent_log.response_content() {
                derived_log.response_content(content);
            }
        });
    }
    if parent_log.is_deferred(RequestLogProperty::ResponseContentPreview) {
        derived_log.defer(RequestLogProperty::ResponseContentPreview);
        let derived_log = derived.log_builder();
        parent_log.on_available(
            RequestLogProperty::ResponseContentPreview,
            move |parent_log| {
                if let Some(preview) = parent_log.response_content_preview() {
                    derived_log.response_content_preview(preview);
                }
            },
        );
    }

    parent.log_builder().add_child(derived.log());
    derived
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hedgerow_transport::{
        Endpoint, EndpointGroup, HttpRequest, SerializationFormat,
    };
    use http::Method;

    use super::*;

    fn parent_with_group() -> ClientRequestContext {
        ClientRequestContext::builder()
            .http_request(HttpRequest::of(Method::GET, "/"))
            .endpoint_group(Arc::new(EndpointGroup::of([
                Endpoint::of("s1", 80),
                Endpoint::of("s2", 80),
                Endpoint::of("s3", 80),
            ])))
            .build()
    }

    #[tokio::test]
    async fn initial_attempt_keeps_the_parent_endpoint() {
        let parent = parent_with_group();
        let derived = derive_context(&parent, parent.http_request(), None, true);
        assert_eq!(derived.endpoint(), parent.endpoint());
    }

    #[tokio::test]
    async fn later_attempts_select_fresh_endpoints() {
        let parent = parent_with_group();
        // The parent consumed "s1" at build time.
        let second = derive_context(&parent, parent.http_request(), None, false);
        let third = derive_context(&parent, parent.http_request(), None, false);

        assert_eq!(second.endpoint().map(|e| e.host().to_owned()), Some("s2".to_owned()));
        assert_eq!(third.endpoint().map(|e| e.host().to_owned()), Some("s3".to_owned()));
    }

    #[tokio::test]
    async fn derived_log_is_attached_as_child() {
        let parent = parent_with_group();
        let _first = derive_context(&parent, parent.http_request(), None, true);
        let _second = derive_context(&parent, parent.http_request(), None, false);
        assert_eq!(parent.log().children().len(), 2);
    }

    #[tokio::test]
    async fn name_and_format_are_copied_when_available() {
        let parent = parent_with_group();
        parent.log_builder().serialization_format(SerializationFormat::JSON);
        parent.log_builder().name_with_service("HelloService", "hello");

        let derived = derive_context(&parent, parent.http_request(), None, true);
        assert_eq!(derived.log().serialization_format(), SerializationFormat::JSON);
        assert_eq!(derived.log().name().as_deref(), Some("hello"));
        assert_eq!(derived.log().service_name().as_deref(), Some("HelloService"));
    }

    #[tokio::test]
    async fn request_content_propagates_when_published_later() {
        let parent = parent_with_group();
        let derived = derive_context(&parent, parent.http_request(), None, true);
        assert!(!derived.log().is_available(RequestLogProperty::RequestContent));

        parent
            .log_builder()
            .request_content(serde_json::json!({"method": "hello"}));
        assert_eq!(
            derived.log().request_content(),
            Some(serde_json::json!({"method": "hello"}))
        );
    }

    #[tokio::test]
    async fn response_content_propagates_only_when_deferred() {
        let undeferred_parent = parent_with_group();
        let derived = derive_context(&undeferred_parent, undeferred_parent.http_request(), None, true);
        undeferred_parent
            .log_builder()
            .response_content(serde_json::json!("ignored"));
        assert_eq!(derived.log().response_content(), None);

        let deferred_parent = parent_with_group();
        deferred_parent
            .log_builder()
            .defer(RequestLogProperty::ResponseContent);
        let derived = derive_context(&deferred_parent, deferred_parent.http_request(), None, true);
        assert!(derived.log().is_deferred(RequestLogProperty::ResponseContent));

        deferred_parent
            .log_builder()
            .response_content(serde_json::json!("copied"));
        assert_eq!(
            derived.log().response_content(),
            Some(serde_json::json!("copied"))
        );
    }
}
