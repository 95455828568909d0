//! Wire types for the relay stream
//!
//! This module contains the Rust side of `proto/relay/v1/relay.proto`.
//! With the `proto-gen` feature the code is generated at build time by
//! tonic-build; otherwise the equivalent hand-declared prost types below
//! are used.

#[cfg(feature = "proto-gen")]
pub mod relay {
    pub mod v1 {
        tonic::include_proto!("relay.v1");
    }
}

#[cfg(not(feature = "proto-gen"))]
pub mod relay {
    pub mod v1 {
        use prost::Message;
        use std::collections::HashMap;

        #[derive(Clone, PartialEq, Message)]
        pub struct InitBackendRequest {
            #[prost(string, tag = "1")]
            pub agent_id: String,
            #[prost(string, tag = "2")]
            pub agent_version: String,
            #[prost(string, tag = "3")]
            pub cluster_uid: String,
            #[prost(string, tag = "4")]
            pub watcher: String,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct InitBackendResponse {
            #[prost(bool, tag = "1")]
            pub accepted: bool,
            #[prost(string, tag = "2")]
            pub message: String,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct Envelope {
            #[prost(string, tag = "1")]
            pub id: String,
            #[prost(message, optional, tag = "2")]
            pub timestamp: Option<prost_types::Timestamp>,
            #[prost(oneof = "envelope::Payload", tags = "3, 4, 5, 6, 7")]
            pub payload: Option<envelope::Payload>,
        }

        pub mod envelope {
            #[derive(Clone, PartialEq, prost::Oneof)]
            pub enum Payload {
                #[prost(message, tag = "3")]
                PodStatus(super::PodStatusUpdate),
                #[prost(message, tag = "4")]
                NodeResources(super::NodeResourceUpdate),
                #[prost(message, tag = "5")]
                NodeUsage(super::NodeUsageUpdate),
                #[prost(message, tag = "6")]
                PodEvent(super::PodEvent),
                #[prost(message, tag = "7")]
                NodeInventory(super::NodeInventory),
            }
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct StreamAck {
            #[prost(string, tag = "1")]
            pub message_id: String,
        }

        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
        #[repr(i32)]
        pub enum TaskStatus {
            Unspecified = 0,
            Pending = 1,
            Running = 2,
            Succeeded = 3,
            Failed = 4,
        }

        impl TaskStatus {
            pub fn as_str_name(&self) -> &'static str {
                match self {
                    TaskStatus::Unspecified => "TASK_STATUS_UNSPECIFIED",
                    TaskStatus::Pending => "TASK_STATUS_PENDING",
                    TaskStatus::Running => "TASK_STATUS_RUNNING",
                    TaskStatus::Succeeded => "TASK_STATUS_SUCCEEDED",
                    TaskStatus::Failed => "TASK_STATUS_FAILED",
                }
            }
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct PodStatusUpdate {
            #[prost(string, tag = "1")]
            pub workflow_id: String,
            #[prost(string, tag = "2")]
            pub task_id: String,
            #[prost(string, tag = "3")]
            pub retry_id: String,
            #[prost(string, tag = "4")]
            pub namespace: String,
            #[prost(string, tag = "5")]
            pub pod_name: String,
            #[prost(string, tag = "6")]
            pub node_name: String,
            #[prost(enumeration = "TaskStatus", tag = "7")]
            pub status: i32,
            #[prost(int32, tag = "8")]
            pub exit_code: i32,
            #[prost(string, tag = "9")]
            pub message: String,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct Taint {
            #[prost(string, tag = "1")]
            pub key: String,
            #[prost(string, tag = "2")]
            pub value: String,
            #[prost(string, tag = "3")]
            pub effect: String,
            #[prost(message, optional, tag = "4")]
            pub time_added: Option<prost_types::Timestamp>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct NodeResourceUpdate {
            #[prost(string, tag = "1")]
            pub hostname: String,
            #[prost(bool, tag = "2")]
            pub available: bool,
            #[prost(string, repeated, tag = "3")]
            pub conditions: Vec<String>,
            #[prost(map = "string, int64", tag = "4")]
            pub allocatable: HashMap<String, i64>,
            #[prost(map = "string, string", tag = "5")]
            pub labels: HashMap<String, String>,
            #[prost(message, repeated, tag = "6")]
            pub taints: Vec<Taint>,
            #[prost(bool, tag = "7")]
            pub deleted: bool,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ResourceUsage {
            #[prost(string, tag = "1")]
            pub cpu: String,
            #[prost(string, tag = "2")]
            pub memory: String,
            #[prost(string, tag = "3")]
            pub ephemeral_storage: String,
            #[prost(string, tag = "4")]
            pub accelerators: String,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct NodeUsageUpdate {
            #[prost(string, tag = "1")]
            pub hostname: String,
            #[prost(message, optional, tag = "2")]
            pub total: Option<ResourceUsage>,
            #[prost(message, optional, tag = "3")]
            pub non_managed: Option<ResourceUsage>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct PodEvent {
            #[prost(string, tag = "1")]
            pub namespace: String,
            #[prost(string, tag = "2")]
            pub pod_name: String,
            #[prost(string, tag = "3")]
            pub event_type: String,
            #[prost(string, tag = "4")]
            pub reason: String,
            #[prost(string, tag = "5")]
            pub message: String,
            #[prost(int32, tag = "6")]
            pub count: i32,
            #[prost(message, optional, tag = "7")]
            pub first_seen: Option<prost_types::Timestamp>,
            #[prost(message, optional, tag = "8")]
            pub last_seen: Option<prost_types::Timestamp>,
            #[prost(string, tag = "9")]
            pub source_component: String,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct NodeInventory {
            #[prost(string, repeated, tag = "1")]
            pub hostnames: Vec<String>,
        }

        pub mod cluster_relay_service_client {
            use super::*;
            use tonic::codegen::*;

            #[derive(Debug, Clone)]
            pub struct ClusterRelayServiceClient<T> {
                inner: tonic::client::Grpc<T>,
            }

            impl ClusterRelayServiceClient<tonic::transport::Channel> {
                pub fn new(channel: tonic::transport::Channel) -> Self {
                    let inner = tonic::client::Grpc::new(channel);
                    Self { inner }
                }
            }

            impl<T> ClusterRelayServiceClient<T>
            where
                T: tonic::client::GrpcService<tonic::body::BoxBody>,
                T::Error: Into<StdError>,
                T::ResponseBody: Body<Data = Bytes> + Send + 'static,
                <T::ResponseBody as Body>::Error: Into<StdError> + Send,
            {
                pub async fn init_backend(
                    &mut self,
                    request: impl tonic::IntoRequest<InitBackendRequest>,
                ) -> Result<tonic::Response<InitBackendResponse>, tonic::Status> {
                    self.inner.ready().await.map_err(|e| {
                        tonic::Status::new(
                            tonic::Code::Unknown,
                            format!("Service was not ready: {}", e.into()),
                        )
                    })?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path = http::uri::PathAndQuery::from_static(
                        "/relay.v1.ClusterRelayService/InitBackend",
                    );
                    self.inner.unary(request.into_request(), path, codec).await
                }

                pub async fn stream_updates(
                    &mut self,
                    request: impl tonic::IntoStreamingRequest<Message = Envelope>,
                ) -> Result<tonic::Response<tonic::codec::Streaming<StreamAck>>, tonic::Status>
                {
                    self.inner.ready().await.map_err(|e| {
                        tonic::Status::new(
                            tonic::Code::Unknown,
                            format!("Service was not ready: {}", e.into()),
                        )
                    })?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path = http::uri::PathAndQuery::from_static(
                        "/relay.v1.ClusterRelayService/StreamUpdates",
                    );
                    self.inner
                        .streaming(request.into_streaming_request(), path, codec)
                        .await
                }
            }
        }
    }
}

pub use relay::v1::cluster_relay_service_client::ClusterRelayServiceClient;
pub use relay::v1::envelope::Payload;
pub use relay::v1::*;

/// Convert a chrono timestamp into the protobuf representation
pub fn to_timestamp(time: chrono::DateTime<chrono::Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: time.timestamp(),
        nanos: time.timestamp_subsec_nanos() as i32,
    }
}

impl Payload {
    /// Short kind label used in logs and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::PodStatus(_) => "pod_status",
            Payload::NodeResources(_) => "node_resources",
            Payload::NodeUsage(_) => "node_usage",
            Payload::PodEvent(_) => "pod_event",
            Payload::NodeInventory(_) => "node_inventory",
        }
    }
}
