//! gRPC transport for route distribution
//!
//! Exposes the distribution server as the aggregated discovery service. The
//! wire messages are hand-written prost messages covering the fields proxies
//! send; route tables travel as JSON inside `Any` payloads.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use protomesh_common::{MeshError, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::codegen::{Body, BoxFuture, StdError};
use tonic::transport::Channel;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::server::{
    DiscoveryRequest as InternalRequest, DiscoveryResponse as InternalResponse, DistributionServer,
    STREAM_QUEUE_CAPACITY,
};
use crate::xds::{type_urls, Node, RouteConfiguration};

/// Fully qualified service name
pub const SERVICE_NAME: &str = "envoy.service.discovery.v3.AggregatedDiscoveryService";

/// Path of the aggregated stream method
pub const STREAM_AGGREGATED_RESOURCES_PATH: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources";

/// Wire messages of the aggregated discovery stream
pub mod proto {
    pub use prost_types::{Any, Struct};

    /// Discovery Request message
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct DiscoveryRequest {
        pub version_info: String,
        pub node: Option<Node>,
        pub resource_names: Vec<String>,
        pub type_url: String,
        pub response_nonce: String,
        pub error_detail: Option<Status>,
    }

    /// Discovery Response message
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct DiscoveryResponse {
        pub version_info: String,
        pub resources: Vec<Any>,
        pub canary: bool,
        pub type_url: String,
        pub nonce: String,
        pub control_plane: Option<ControlPlane>,
    }

    /// Node identifier
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Node {
        pub id: String,
        pub cluster: String,
        pub metadata: Option<Struct>,
        pub locality: Option<Locality>,
        pub user_agent_name: String,
        pub user_agent_version: String,
        pub client_features: Vec<String>,
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Locality {
        pub region: String,
        pub zone: String,
        pub sub_zone: String,
    }

    /// Status (error detail)
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Status {
        pub code: i32,
        pub message: String,
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct ControlPlane {
        pub identifier: String,
    }

    impl prost::Message for DiscoveryRequest {
        fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
        where
            Self: Sized,
        {
            if !self.version_info.is_empty() {
                prost::encoding::string::encode(1, &self.version_info, buf);
            }
            if let Some(ref node) = self.node {
                prost::encoding::message::encode(2, node, buf);
            }
            for name in &self.resource_names {
                prost::encoding::string::encode(3, name, buf);
            }
            if !self.type_url.is_empty() {
                prost::encoding::string::encode(4, &self.type_url, buf);
            }
            if !self.response_nonce.is_empty() {
                prost::encoding::string::encode(5, &self.response_nonce, buf);
            }
            if let Some(ref error) = self.error_detail {
                prost::encoding::message::encode(6, error, buf);
            }
        }

        fn merge_field(
            &mut self,
            tag: u32,
            wire_type: prost::encoding::WireType,
            buf: &mut impl prost::bytes::Buf,
            ctx: prost::encoding::DecodeContext,
        ) -> Result<(), prost::DecodeError>
        where
            Self: Sized,
        {
            match tag {
                1 => prost::encoding::string::merge(wire_type, &mut self.version_info, buf, ctx),
                2 => {
                    let mut node = self.node.take().unwrap_or_default();
                    prost::encoding::message::merge(wire_type, &mut node, buf, ctx)?;
                    self.node = Some(node);
                    Ok(())
                }
                3 => prost::encoding::string::merge_repeated(wire_type, &mut self.resource_names, buf, ctx),
                4 => prost::encoding::string::merge(wire_type, &mut self.type_url, buf, ctx),
                5 => prost::encoding::string::merge(wire_type, &mut self.response_nonce, buf, ctx),
                6 => {
                    let mut error = self.error_detail.take().unwrap_or_default();
                    prost::encoding::message::merge(wire_type, &mut error, buf, ctx)?;
                    self.error_detail = Some(error);
                    Ok(())
                }
                _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
            }
        }

        fn encoded_len(&self) -> usize {
            let mut len = 0;
            if !self.version_info.is_empty() {
                len += prost::encoding::string::encoded_len(1, &self.version_info);
            }
            if let Some(ref node) = self.node {
                len += prost::encoding::message::encoded_len(2, node);
            }
            len += prost::encoding::string::encoded_len_repeated(3, &self.resource_names);
            if !self.type_url.is_empty() {
                len += prost::encoding::string::encoded_len(4, &self.type_url);
            }
            if !self.response_nonce.is_empty() {
                len += prost::encoding::string::encoded_len(5, &self.response_nonce);
            }
            if let Some(ref error) = self.error_detail {
                len += prost::encoding::message::encoded_len(6, error);
            }
            len
        }

        fn clear(&mut self) {
            *self = Self::default();
        }
    }

    impl prost::Message for DiscoveryResponse {
        fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
        where
            Self: Sized,
        {
            if !self.version_info.is_empty() {
                prost::encoding::string::encode(1, &self.version_info, buf);
            }
            for resource in &self.resources {
                prost::encoding::message::encode(2, resource, buf);
            }
            if self.canary {
                prost::encoding::bool::encode(3, &self.canary, buf);
            }
            if !self.type_url.is_empty() {
                prost::encoding::string::encode(4, &self.type_url, buf);
            }
            if !self.nonce.is_empty() {
                prost::encoding::string::encode(5, &self.nonce, buf);
            }
            if let Some(ref cp) = self.control_plane {
                prost::encoding::message::encode(6, cp, buf);
            }
        }

        fn merge_field(
            &mut self,
            tag: u32,
            wire_type: prost::encoding::WireType,
            buf: &mut impl prost::bytes::Buf,
            ctx: prost::encoding::DecodeContext,
        ) -> Result<(), prost::DecodeError>
        where
            Self: Sized,
        {
            match tag {
                1 => prost::encoding::string::merge(wire_type, &mut self.version_info, buf, ctx),
                2 => prost::encoding::message::merge_repeated(wire_type, &mut self.resources, buf, ctx),
                3 => prost::encoding::bool::merge(wire_type, &mut self.canary, buf, ctx),
                4 => prost::encoding::string::merge(wire_type, &mut self.type_url, buf, ctx),
                5 => prost::encoding::string::merge(wire_type, &mut self.nonce, buf, ctx),
                6 => {
                    let mut cp = self.control_plane.take().unwrap_or_default();
                    prost::encoding::message::merge(wire_type, &mut cp, buf, ctx)?;
                    self.control_plane = Some(cp);
                    Ok(())
                }
                _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
            }
        }

        fn encoded_len(&self) -> usize {
            let mut len = 0;
            if !self.version_info.is_empty() {
                len += prost::encoding::string::encoded_len(1, &self.version_info);
            }
            len += prost::encoding::message::encoded_len_repeated(2, &self.resources);
            if self.canary {
                len += prost::encoding::bool::encoded_len(3, &self.canary);
            }
            if !self.type_url.is_empty() {
                len += prost::encoding::string::encoded_len(4, &self.type_url);
            }
            if !self.nonce.is_empty() {
                len += prost::encoding::string::encoded_len(5, &self.nonce);
            }
            if let Some(ref cp) = self.control_plane {
                len += prost::encoding::message::encoded_len(6, cp);
            }
            len
        }

        fn clear(&mut self) {
            *self = Self::default();
        }
    }

    impl prost::Message for Node {
        fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
        where
            Self: Sized,
        {
            if !self.id.is_empty() {
                prost::encoding::string::encode(1, &self.id, buf);
            }
            if !self.cluster.is_empty() {
                prost::encoding::string::encode(2, &self.cluster, buf);
            }
            if let Some(ref metadata) = self.metadata {
                prost::encoding::message::encode(3, metadata, buf);
            }
            if let Some(ref locality) = self.locality {
                prost::encoding::message::encode(4, locality, buf);
            }
            if !self.user_agent_name.is_empty() {
                prost::encoding::string::encode(6, &self.user_agent_name, buf);
            }
            if !self.user_agent_version.is_empty() {
                prost::encoding::string::encode(7, &self.user_agent_version, buf);
            }
            for feature in &self.client_features {
                prost::encoding::string::encode(10, feature, buf);
            }
        }

        fn merge_field(
            &mut self,
            tag: u32,
            wire_type: prost::encoding::WireType,
            buf: &mut impl prost::bytes::Buf,
            ctx: prost::encoding::DecodeContext,
        ) -> Result<(), prost::DecodeError>
        where
            Self: Sized,
        {
            match tag {
                1 => prost::encoding::string::merge(wire_type, &mut self.id, buf, ctx),
                2 => prost::encoding::string::merge(wire_type, &mut self.cluster, buf, ctx),
                3 => {
                    let mut metadata = self.metadata.take().unwrap_or_default();
                    prost::encoding::message::merge(wire_type, &mut metadata, buf, ctx)?;
                    self.metadata = Some(metadata);
                    Ok(())
                }
                4 => {
                    let mut locality = self.locality.take().unwrap_or_default();
                    prost::encoding::message::merge(wire_type, &mut locality, buf, ctx)?;
                    self.locality = Some(locality);
                    Ok(())
                }
                6 => prost::encoding::string::merge(wire_type, &mut self.user_agent_name, buf, ctx),
                7 => prost::encoding::string::merge(wire_type, &mut self.user_agent_version, buf, ctx),
                10 => prost::encoding::string::merge_repeated(wire_type, &mut self.client_features, buf, ctx),
                _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
            }
        }

        fn encoded_len(&self) -> usize {
            let mut len = 0;
            if !self.id.is_empty() {
                len += prost::encoding::string::encoded_len(1, &self.id);
            }
            if !self.cluster.is_empty() {
                len += prost::encoding::string::encoded_len(2, &self.cluster);
            }
            if let Some(ref metadata) = self.metadata {
                len += prost::encoding::message::encoded_len(3, metadata);
            }
            if let Some(ref locality) = self.locality {
                len += prost::encoding::message::encoded_len(4, locality);
            }
            if !self.user_agent_name.is_empty() {
                len += prost::encoding::string::encoded_len(6, &self.user_agent_name);
            }
            if !self.user_agent_version.is_empty() {
                len += prost::encoding::string::encoded_len(7, &self.user_agent_version);
            }
            len += prost::encoding::string::encoded_len_repeated(10, &self.client_features);
            len
        }

        fn clear(&mut self) {
            *self = Self::default();
        }
    }

    impl prost::Message for Locality {
        fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
        where
            Self: Sized,
        {
            if !self.region.is_empty() {
                prost::encoding::string::encode(1, &self.region, buf);
            }
            if !self.zone.is_empty() {
                prost::encoding::string::encode(2, &self.zone, buf);
            }
            if !self.sub_zone.is_empty() {
                prost::encoding::string::encode(3, &self.sub_zone, buf);
            }
        }

        fn merge_field(
            &mut self,
            tag: u32,
            wire_type: prost::encoding::WireType,
            buf: &mut impl prost::bytes::Buf,
            ctx: prost::encoding::DecodeContext,
        ) -> Result<(), prost::DecodeError>
        where
            Self: Sized,
        {
            match tag {
                1 => prost::encoding::string::merge(wire_type, &mut self.region, buf, ctx),
                2 => prost::encoding::string::merge(wire_type, &mut self.zone, buf, ctx),
                3 => prost::encoding::string::merge(wire_type, &mut self.sub_zone, buf, ctx),
                _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
            }
        }

        fn encoded_len(&self) -> usize {
            let mut len = 0;
            if !self.region.is_empty() {
                len += prost::encoding::string::encoded_len(1, &self.region);
            }
            if !self.zone.is_empty() {
                len += prost::encoding::string::encoded_len(2, &self.zone);
            }
            if !self.sub_zone.is_empty() {
                len += prost::encoding::string::encoded_len(3, &self.sub_zone);
            }
            len
        }

        fn clear(&mut self) {
            *self = Self::default();
        }
    }

    impl prost::Message for Status {
        fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
        where
            Self: Sized,
        {
            if self.code != 0 {
                prost::encoding::int32::encode(1, &self.code, buf);
            }
            if !self.message.is_empty() {
                prost::encoding::string::encode(2, &self.message, buf);
            }
        }

        fn merge_field(
            &mut self,
            tag: u32,
            wire_type: prost::encoding::WireType,
            buf: &mut impl prost::bytes::Buf,
            ctx: prost::encoding::DecodeContext,
        ) -> Result<(), prost::DecodeError>
        where
            Self: Sized,
        {
            match tag {
                1 => prost::encoding::int32::merge(wire_type, &mut self.code, buf, ctx),
                2 => prost::encoding::string::merge(wire_type, &mut self.message, buf, ctx),
                _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
            }
        }

        fn encoded_len(&self) -> usize {
            let mut len = 0;
            if self.code != 0 {
                len += prost::encoding::int32::encoded_len(1, &self.code);
            }
            if !self.message.is_empty() {
                len += prost::encoding::string::encoded_len(2, &self.message);
            }
            len
        }

        fn clear(&mut self) {
            *self = Self::default();
        }
    }

    impl prost::Message for ControlPlane {
        fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
        where
            Self: Sized,
        {
            if !self.identifier.is_empty() {
                prost::encoding::string::encode(1, &self.identifier, buf);
            }
        }

        fn merge_field(
            &mut self,
            tag: u32,
            wire_type: prost::encoding::WireType,
            buf: &mut impl prost::bytes::Buf,
            ctx: prost::encoding::DecodeContext,
        ) -> Result<(), prost::DecodeError>
        where
            Self: Sized,
        {
            match tag {
                1 => prost::encoding::string::merge(wire_type, &mut self.identifier, buf, ctx),
                _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
            }
        }

        fn encoded_len(&self) -> usize {
            if !self.identifier.is_empty() {
                prost::encoding::string::encoded_len(1, &self.identifier)
            } else {
                0
            }
        }

        fn clear(&mut self) {
            *self = Self::default();
        }
    }
}

/// Convert a wire request into the server's request
pub fn to_internal_request(req: &proto::DiscoveryRequest) -> InternalRequest {
    InternalRequest {
        version_info: req.version_info.clone(),
        node: req.node.as_ref().map(to_internal_node),
        resource_names: req.resource_names.clone(),
        type_url: req.type_url.clone(),
        response_nonce: req.response_nonce.clone(),
        error_detail: req.error_detail.as_ref().map(|status| {
            if status.message.is_empty() {
                format!("code {}", status.code)
            } else {
                status.message.clone()
            }
        }),
    }
}

/// Only string-valued metadata entries are kept
fn to_internal_node(node: &proto::Node) -> Node {
    use prost_types::value::Kind;

    let metadata = node
        .metadata
        .iter()
        .flat_map(|s| s.fields.iter())
        .filter_map(|(key, value)| match &value.kind {
            Some(Kind::StringValue(s)) => Some((key.clone(), s.clone())),
            _ => None,
        })
        .collect();

    Node {
        id: node.id.clone(),
        cluster: node.cluster.clone(),
        metadata,
    }
}

/// Convert a server response into the wire response
pub fn to_proto_response(resp: &InternalResponse) -> Result<proto::DiscoveryResponse> {
    let resources = resp
        .resources
        .iter()
        .map(|route| {
            Ok(proto::Any {
                type_url: type_urls::ROUTE_CONFIGURATION.to_string(),
                value: serde_json::to_vec(route).map_err(|e| {
                    MeshError::InvariantViolation(format!("route {} not serializable: {}", route.name, e))
                })?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(proto::DiscoveryResponse {
        version_info: resp.version_info.clone(),
        resources,
        canary: false,
        type_url: resp.type_url.clone(),
        nonce: resp.nonce.clone(),
        control_plane: Some(proto::ControlPlane {
            identifier: resp.control_plane_id.clone(),
        }),
    })
}

/// Decode a route table carried in a response
pub fn decode_route(resource: &proto::Any) -> Result<RouteConfiguration> {
    if resource.type_url != type_urls::ROUTE_CONFIGURATION {
        return Err(MeshError::InvariantViolation(format!(
            "unexpected resource type {}",
            resource.type_url
        )));
    }
    serde_json::from_slice(&resource.value)
        .map_err(|e| MeshError::InvariantViolation(format!("malformed route payload: {}", e)))
}

/// Response stream type
pub type ResponseStream = Pin<Box<dyn Stream<Item = std::result::Result<proto::DiscoveryResponse, Status>> + Send>>;

/// ADS gRPC service trait
#[tonic::async_trait]
pub trait AggregatedDiscoveryService: Send + Sync + 'static {
    /// Server streaming response type for StreamAggregatedResources
    type StreamAggregatedResourcesStream: Stream<Item = std::result::Result<proto::DiscoveryResponse, Status>>
        + Send
        + 'static;

    /// Full-state streaming aggregated discovery
    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<proto::DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status>;
}

/// Aggregated discovery backed by the distribution server
pub struct AdsService {
    server: Arc<DistributionServer>,
}

impl AdsService {
    pub fn new(server: Arc<DistributionServer>) -> Self {
        Self { server }
    }
}

async fn recv_push(push: &mut Option<mpsc::Receiver<InternalResponse>>) -> Option<InternalResponse> {
    match push {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn to_wire(resp: &InternalResponse) -> std::result::Result<proto::DiscoveryResponse, Status> {
    to_proto_response(resp).map_err(|e| Status::internal(e.to_string()))
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for AdsService {
    type StreamAggregatedResourcesStream = ResponseStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<proto::DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        let remote_addr = request.remote_addr();
        let mut inbound = request.into_inner();
        let server = self.server.clone();

        let (tx, rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);

        tokio::spawn(async move {
            let mut registered: Option<(String, u64)> = None;
            let mut push: Option<mpsc::Receiver<InternalResponse>> = None;

            loop {
                tokio::select! {
                    message = inbound.next() => match message {
                        Some(Ok(req)) => {
                            let req = to_internal_request(&req);

                            if registered.is_none() {
                                let Some(node) = req.node.clone().filter(|n| !n.id.is_empty()) else {
                                    warn!(?remote_addr, "First discovery request carries no node");
                                    let _ = tx
                                        .send(Err(Status::invalid_argument("first request must identify the node")))
                                        .await;
                                    break;
                                };
                                info!(node_id = %node.id, ?remote_addr, "New discovery stream established");
                                let node_id = node.id.clone();
                                let (stream_id, rx) = server.register_stream(node);
                                registered = Some((node_id, stream_id));
                                push = Some(rx);
                            }

                            let Some((node_id, _)) = registered.as_ref() else {
                                break;
                            };
                            debug!(
                                node_id = %node_id,
                                version = %req.version_info,
                                nonce = %req.response_nonce,
                                "Received discovery request"
                            );
                            if let Some(resp) = server.handle_request(node_id, &req)
                                && tx.send(to_wire(&resp)).await.is_err()
                            {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Error receiving discovery request");
                            break;
                        }
                        None => break,
                    },
                    pushed = recv_push(&mut push) => match pushed {
                        Some(resp) => {
                            if tx.send(to_wire(&resp)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            debug!("Stream replaced by a newer connection of the same node");
                            break;
                        }
                    },
                }
            }

            if let Some((node_id, stream_id)) = registered {
                info!(node_id = %node_id, stream_id, "Discovery stream closed");
                server.unregister_stream(&node_id, stream_id);
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as ResponseStream))
    }
}

/// Routes gRPC requests to an [`AggregatedDiscoveryService`]
#[derive(Debug)]
pub struct AdsServer<T> {
    inner: Arc<T>,
}

impl<T> AdsServer<T> {
    pub fn new(inner: T) -> Self {
        Self::from_arc(Arc::new(inner))
    }

    pub fn from_arc(inner: Arc<T>) -> Self {
        Self { inner }
    }
}

impl<T> Clone for AdsServer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> tonic::server::NamedService for AdsServer<T> {
    const NAME: &'static str = SERVICE_NAME;
}

struct StreamAggregatedResourcesSvc<T>(Arc<T>);

impl<T: AggregatedDiscoveryService> tonic::server::StreamingService<proto::DiscoveryRequest>
    for StreamAggregatedResourcesSvc<T>
{
    type Response = proto::DiscoveryResponse;
    type ResponseStream = T::StreamAggregatedResourcesStream;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: Request<Streaming<proto::DiscoveryRequest>>) -> Self::Future {
        let inner = self.0.clone();
        Box::pin(async move { inner.stream_aggregated_resources(request).await })
    }
}

impl<T, B> tonic::codegen::Service<http::Request<B>> for AdsServer<T>
where
    T: AggregatedDiscoveryService,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        match req.uri().path() {
            STREAM_AGGREGATED_RESOURCES_PATH => {
                let inner = self.inner.clone();
                Box::pin(async move {
                    let method = StreamAggregatedResourcesSvc(inner);
                    let mut grpc = tonic::server::Grpc::new(tonic_prost::ProstCodec::default());
                    Ok(grpc.streaming(method, req).await)
                })
            }
            path => {
                debug!(path = %path, "Unimplemented gRPC method");
                Box::pin(async move {
                    let mut response = http::Response::new(tonic::body::Body::default());
                    let headers = response.headers_mut();
                    headers.insert(
                        tonic::Status::GRPC_STATUS,
                        (tonic::Code::Unimplemented as i32).into(),
                    );
                    headers.insert(http::header::CONTENT_TYPE, tonic::metadata::GRPC_CONTENT_TYPE);
                    Ok(response)
                })
            }
        }
    }
}

/// Client side of the aggregated stream
#[derive(Debug, Clone)]
pub struct AdsClient {
    inner: tonic::client::Grpc<Channel>,
}

impl AdsClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn stream_aggregated_resources(
        &mut self,
        request: impl tonic::IntoStreamingRequest<Message = proto::DiscoveryRequest>,
    ) -> std::result::Result<Response<Streaming<proto::DiscoveryResponse>>, Status> {
        self.inner.ready().await.map_err(|e| {
            let e: StdError = e.into();
            Status::unknown(format!("Service was not ready: {}", e))
        })?;
        let path = http::uri::PathAndQuery::from_static(STREAM_AGGREGATED_RESOURCES_PATH);
        self.inner
            .streaming(request.into_streaming_request(), path, tonic_prost::ProstCodec::default())
            .await
    }
}

/// Serve the aggregated discovery service on `addr` until shutdown
pub async fn serve(
    server: Arc<DistributionServer>,
    addr: SocketAddr,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| MeshError::Transport(format!("failed to bind {}: {}", addr, e)))?;
    serve_with_listener(server, listener, shutdown).await
}

/// Serve on an already bound listener
pub async fn serve_with_listener(
    server: Arc<DistributionServer>,
    listener: TcpListener,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|e| MeshError::Transport(e.to_string()))?;
    info!(addr = %addr, "Starting discovery gRPC server");

    tonic::transport::Server::builder()
        .add_service(AdsServer::new(AdsService::new(server)))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            let _ = shutdown.recv().await;
            info!("Discovery gRPC server shutting down");
        })
        .await
        .map_err(|e| MeshError::Transport(e.to_string()))
}
