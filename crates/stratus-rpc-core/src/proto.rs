//! Worker protocol messages.
//!
//! Every frame on the `EventStream` is a [`StreamingMessage`] whose `content`
//! names the message kind. Request/response pairs are correlated by an
//! explicit id: the worker id for stream-level frames, the function id for
//! loads and the invocation id for invocations.

use bytes::Bytes;
use std::collections::HashMap;

include!(concat!(env!("OUT_DIR"), "/stratus.rpc.FunctionRpc.rs"));

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingMessage {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(
        oneof = "streaming_message::Content",
        tags = "20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31"
    )]
    pub content: Option<streaming_message::Content>,
}

pub mod streaming_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Content {
        #[prost(message, tag = "20")]
        StartStream(super::StartStream),
        #[prost(message, tag = "21")]
        WorkerInitRequest(super::WorkerInitRequest),
        #[prost(message, tag = "22")]
        WorkerInitResponse(super::WorkerInitResponse),
        #[prost(message, tag = "23")]
        FunctionLoadRequest(super::FunctionLoadRequest),
        #[prost(message, tag = "24")]
        FunctionLoadResponse(super::FunctionLoadResponse),
        #[prost(message, tag = "25")]
        InvocationRequest(super::InvocationRequest),
        #[prost(message, tag = "26")]
        InvocationResponse(super::InvocationResponse),
        #[prost(message, tag = "27")]
        FunctionEnvironmentReloadRequest(super::FunctionEnvironmentReloadRequest),
        #[prost(message, tag = "28")]
        FunctionEnvironmentReloadResponse(super::FunctionEnvironmentReloadResponse),
        #[prost(message, tag = "29")]
        RpcLog(super::RpcLog),
        #[prost(message, tag = "30")]
        WorkerTerminate(super::WorkerTerminate),
        #[prost(message, tag = "31")]
        InvocationCancel(super::InvocationCancel),
    }
}

impl StreamingMessage {
    /// Wraps `content` in a frame tagged with `request_id`.
    pub fn new(request_id: impl Into<String>, content: streaming_message::Content) -> Self {
        Self {
            request_id: request_id.into(),
            content: Some(content),
        }
    }

    /// Short name of the carried message kind, for logs.
    pub fn kind(&self) -> &'static str {
        use streaming_message::Content;
        match &self.content {
            None => "Empty",
            Some(Content::StartStream(_)) => "StartStream",
            Some(Content::WorkerInitRequest(_)) => "WorkerInitRequest",
            Some(Content::WorkerInitResponse(_)) => "WorkerInitResponse",
            Some(Content::FunctionLoadRequest(_)) => "FunctionLoadRequest",
            Some(Content::FunctionLoadResponse(_)) => "FunctionLoadResponse",
            Some(Content::InvocationRequest(_)) => "InvocationRequest",
            Some(Content::InvocationResponse(_)) => "InvocationResponse",
            Some(Content::FunctionEnvironmentReloadRequest(_)) => {
                "FunctionEnvironmentReloadRequest"
            }
            Some(Content::FunctionEnvironmentReloadResponse(_)) => {
                "FunctionEnvironmentReloadResponse"
            }
            Some(Content::RpcLog(_)) => "RpcLog",
            Some(Content::WorkerTerminate(_)) => "WorkerTerminate",
            Some(Content::InvocationCancel(_)) => "InvocationCancel",
        }
    }
}

/// First frame sent by a worker after it connects.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartStream {
    #[prost(string, tag = "2")]
    pub worker_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerInitRequest {
    #[prost(string, tag = "1")]
    pub host_version: String,
    #[prost(map = "string, string", tag = "2")]
    pub capabilities: HashMap<String, String>,
    #[prost(string, tag = "3")]
    pub worker_directory: String,
    #[prost(string, tag = "4")]
    pub function_app_directory: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerInitResponse {
    #[prost(string, tag = "1")]
    pub worker_version: String,
    #[prost(map = "string, string", tag = "2")]
    pub capabilities: HashMap<String, String>,
    #[prost(message, optional, tag = "3")]
    pub result: Option<StatusResult>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusResult {
    #[prost(enumeration = "status_result::Status", tag = "4")]
    pub status: i32,
    #[prost(string, tag = "1")]
    pub result: String,
    #[prost(message, optional, tag = "2")]
    pub exception: Option<RpcException>,
}

pub mod status_result {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Status {
        Failure = 0,
        Success = 1,
        Cancelled = 2,
    }
}

impl StatusResult {
    pub fn success() -> Self {
        Self {
            status: status_result::Status::Success as i32,
            result: String::new(),
            exception: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: status_result::Status::Failure as i32,
            result: String::new(),
            exception: Some(RpcException {
                message: message.into(),
                ..Default::default()
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == status_result::Status::Success
    }

    /// The worker-supplied failure message, falling back to the raw status.
    pub fn failure_message(&self) -> String {
        match &self.exception {
            Some(exception) if !exception.message.is_empty() => exception.message.clone(),
            _ => format!("{:?}", self.status()),
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcException {
    #[prost(string, tag = "3")]
    pub source: String,
    #[prost(string, tag = "1")]
    pub stack_trace: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FunctionLoadRequest {
    #[prost(string, tag = "1")]
    pub function_id: String,
    #[prost(message, optional, tag = "2")]
    pub metadata: Option<RpcFunctionMetadata>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FunctionLoadResponse {
    #[prost(string, tag = "1")]
    pub function_id: String,
    #[prost(message, optional, tag = "2")]
    pub result: Option<StatusResult>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcFunctionMetadata {
    #[prost(string, tag = "4")]
    pub name: String,
    #[prost(string, tag = "1")]
    pub directory: String,
    #[prost(string, tag = "2")]
    pub script_file: String,
    #[prost(string, tag = "3")]
    pub language: String,
    #[prost(bool, tag = "7")]
    pub is_disabled: bool,
    #[prost(string, tag = "8")]
    pub trigger_kind: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InvocationRequest {
    #[prost(string, tag = "1")]
    pub invocation_id: String,
    #[prost(string, tag = "2")]
    pub function_id: String,
    #[prost(message, repeated, tag = "3")]
    pub input_data: Vec<ParameterBinding>,
    #[prost(map = "string, message", tag = "4")]
    pub trigger_metadata: HashMap<String, TypedData>,
    #[prost(message, optional, tag = "5")]
    pub trace_context: Option<RpcTraceContext>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InvocationResponse {
    #[prost(string, tag = "1")]
    pub invocation_id: String,
    #[prost(message, repeated, tag = "2")]
    pub output_data: Vec<ParameterBinding>,
    #[prost(message, optional, tag = "4")]
    pub return_value: Option<TypedData>,
    #[prost(message, optional, tag = "3")]
    pub result: Option<StatusResult>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InvocationCancel {
    #[prost(string, tag = "2")]
    pub invocation_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcTraceContext {
    #[prost(string, tag = "1")]
    pub trace_parent: String,
    #[prost(string, tag = "2")]
    pub trace_state: String,
    #[prost(map = "string, string", tag = "3")]
    pub attributes: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParameterBinding {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub data: Option<TypedData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TypedData {
    #[prost(oneof = "typed_data::Data", tags = "1, 2, 3, 4, 5")]
    pub data: Option<typed_data::Data>,
}

pub mod typed_data {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Data {
        #[prost(string, tag = "1")]
        String(String),
        #[prost(string, tag = "2")]
        Json(String),
        #[prost(bytes = "bytes", tag = "3")]
        Bytes(Bytes),
        #[prost(sint64, tag = "4")]
        Int(i64),
        #[prost(double, tag = "5")]
        Double(f64),
    }
}

impl TypedData {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            data: Some(typed_data::Data::String(value.into())),
        }
    }

    pub fn bytes(value: impl Into<Bytes>) -> Self {
        Self {
            data: Some(typed_data::Data::Bytes(value.into())),
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FunctionEnvironmentReloadRequest {
    #[prost(map = "string, string", tag = "1")]
    pub environment_variables: HashMap<String, String>,
    #[prost(string, tag = "2")]
    pub function_app_directory: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FunctionEnvironmentReloadResponse {
    #[prost(map = "string, string", tag = "1")]
    pub capabilities: HashMap<String, String>,
    #[prost(message, optional, tag = "3")]
    pub result: Option<StatusResult>,
}

/// Log and system-log frames emitted by a worker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcLog {
    #[prost(string, tag = "1")]
    pub invocation_id: String,
    #[prost(string, tag = "2")]
    pub category: String,
    #[prost(enumeration = "rpc_log::Level", tag = "3")]
    pub level: i32,
    #[prost(string, tag = "4")]
    pub message: String,
    #[prost(message, optional, tag = "6")]
    pub exception: Option<RpcException>,
    #[prost(enumeration = "rpc_log::RpcLogCategory", tag = "8")]
    pub log_category: i32,
}

pub mod rpc_log {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Level {
        Trace = 0,
        Debug = 1,
        Information = 2,
        Warning = 3,
        Error = 4,
        Critical = 5,
        None = 6,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum RpcLogCategory {
        User = 0,
        System = 1,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerTerminate {
    #[prost(uint64, tag = "1")]
    pub grace_period_ms: u64,
}
