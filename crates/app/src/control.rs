//! Control service: JSON-RPC 2.0 routing of control requests to the registry.
//!
//! The service is transport-agnostic: a driving adapter hands it one request
//! line at a time and writes the reply back. Methods are grouped per device
//! family (`sen0395.command`, `sen0311.status`, ...), plus `events.subscribe`
//! and `ping`.

use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use sensord_domain::command::{Command, CommandKind};
use sensord_domain::error::{NotFoundError, SensordError};
use sensord_domain::sensor::SensorKind;

use crate::dispatcher::EventDispatcher;
use crate::event_bus::Subscription;
use crate::ports::TransportOpener;
use crate::registry::{SensorRegistry, Target};

pub const JSONRPC_VERSION: &str = "2.0";

/// Error codes returned in [`RpcError::code`].
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SENSOR_NOT_FOUND: i64 = -32001;
    pub const NO_SENSORS: i64 = -32002;
    pub const UNKNOWN_COMMAND: i64 = -32003;
    pub const NOT_A_CONFIG_COMMAND: i64 = -32004;
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RpcRequest {
    #[must_use]
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id: Value::from(id),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<SensordError> for RpcError {
    fn from(err: SensordError) -> Self {
        match err {
            SensordError::NotFound(NotFoundError::NoSensors) => {
                Self::new(codes::NO_SENSORS, NotFoundError::NoSensors.to_string())
            }
            SensordError::NotFound(inner) => Self::new(codes::SENSOR_NOT_FOUND, inner.to_string()),
            SensordError::Validation(inner) => Self::new(codes::INVALID_PARAMS, inner.to_string()),
            SensordError::Transport(inner) => Self::new(codes::INTERNAL_ERROR, inner.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Split the response into its result or error.
    ///
    /// # Errors
    ///
    /// Returns the carried [`RpcError`] when the call failed.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error),
            (None, result) => Ok(result.unwrap_or(Value::Null)),
        }
    }
}

/// What the connection should do after a request.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlReply {
    /// Write the response and wait for the next request.
    Response(RpcResponse),
    /// Write the acknowledgement, then stream events until the peer leaves.
    Subscribe(RpcResponse),
}

impl ControlReply {
    #[must_use]
    pub fn response(&self) -> &RpcResponse {
        match self {
            Self::Response(response) | Self::Subscribe(response) => response,
        }
    }

    #[must_use]
    pub fn into_response(self) -> RpcResponse {
        match self {
            Self::Response(response) | Self::Subscribe(response) => response,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Ping,
    Subscribe,
    Command(SensorKind),
    Configure(SensorKind),
    Status(SensorKind),
    Reading(SensorKind),
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ping" => return Ok(Self::Ping),
            "events.subscribe" => return Ok(Self::Subscribe),
            _ => {}
        }
        let (group, action) = s.split_once('.').ok_or(())?;
        let kind = group.parse::<SensorKind>().map_err(|_| ())?;
        match action {
            "command" => Ok(Self::Command(kind)),
            "configure" => Ok(Self::Configure(kind)),
            "status" => Ok(Self::Status(kind)),
            "reading" => Ok(Self::Reading(kind)),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommandParams {
    #[serde(default)]
    name: Option<String>,
    command: String,
    #[serde(default)]
    args: Vec<i64>,
}

impl CommandParams {
    fn command(&self) -> Result<Command, RpcError> {
        let kind = self.command.parse::<CommandKind>().map_err(|_| {
            RpcError::new(
                codes::UNKNOWN_COMMAND,
                format!("unknown command {}", self.command),
            )
        })?;
        Command::from_args(kind, &self.args)
            .map_err(|err| RpcError::new(codes::INVALID_PARAMS, err.to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
struct TargetParams {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReadingParams {
    #[serde(default)]
    name: Option<String>,
    enabled: bool,
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    let params = if params.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        params
    };
    serde_json::from_value(params)
        .map_err(|err| RpcError::new(codes::INVALID_PARAMS, format!("invalid params: {err}")))
}

/// `{ key: value }`, serialized.
fn wrap(key: &str, value: impl Serialize) -> Result<Value, RpcError> {
    let value = serde_json::to_value(value)
        .map_err(|err| RpcError::new(codes::INTERNAL_ERROR, err.to_string()))?;
    let mut object = serde_json::Map::new();
    object.insert(key.to_string(), value);
    Ok(Value::Object(object))
}

/// Answers control requests against a [`SensorRegistry`].
pub struct ControlService<O> {
    registry: Arc<SensorRegistry<O>>,
    dispatcher: Arc<EventDispatcher>,
}

impl<O: TransportOpener> ControlService<O> {
    pub fn new(registry: Arc<SensorRegistry<O>>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }

    /// Receive every event published after this call.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.dispatcher.subscribe()
    }

    /// Parse and answer one request line. Malformed input yields an error
    /// response, never a panic.
    pub async fn handle_line(&self, line: &str) -> ControlReply {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                return ControlReply::Response(RpcResponse::failure(
                    Value::Null,
                    RpcError::new(codes::PARSE_ERROR, format!("parse error: {err}")),
                ));
            }
        };
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        match serde_json::from_value::<RpcRequest>(value) {
            Ok(request) => self.handle(request).await,
            Err(err) => ControlReply::Response(RpcResponse::failure(
                id,
                RpcError::new(codes::INVALID_REQUEST, format!("invalid request: {err}")),
            )),
        }
    }

    #[tracing::instrument(skip_all, fields(method = %request.method))]
    pub async fn handle(&self, request: RpcRequest) -> ControlReply {
        let RpcRequest {
            jsonrpc,
            id,
            method,
            params,
        } = request;
        if jsonrpc != JSONRPC_VERSION {
            return ControlReply::Response(RpcResponse::failure(
                id,
                RpcError::new(
                    codes::INVALID_REQUEST,
                    format!("unsupported jsonrpc version {jsonrpc}"),
                ),
            ));
        }
        let Ok(method) = method.parse::<Method>() else {
            return ControlReply::Response(RpcResponse::failure(
                id,
                RpcError::new(codes::METHOD_NOT_FOUND, format!("method {method} not found")),
            ));
        };
        if method == Method::Subscribe {
            tracing::debug!("client subscribed to events");
            return ControlReply::Subscribe(RpcResponse::success(id, json!({"subscribed": true})));
        }

        match self.call(method, params).await {
            Ok(result) => ControlReply::Response(RpcResponse::success(id, result)),
            Err(error) => {
                tracing::debug!(code = error.code, message = %error.message, "request failed");
                ControlReply::Response(RpcResponse::failure(id, error))
            }
        }
    }

    async fn call(&self, method: Method, params: Value) -> Result<Value, RpcError> {
        match method {
            Method::Ping | Method::Subscribe => Ok(json!("pong")),
            Method::Command(kind) => {
                let params: CommandParams = parse_params(params)?;
                let command = params.command()?;
                self.run(Target::kind(kind, params.name), command).await
            }
            Method::Configure(kind) => {
                let params: CommandParams = parse_params(params)?;
                let command = params.command()?;
                if !command.is_config() {
                    return Err(RpcError::new(
                        codes::NOT_A_CONFIG_COMMAND,
                        format!("{} is not a configuration command", command.kind()),
                    ));
                }
                self.run(Target::kind(kind, params.name), command).await
            }
            Method::Status(kind) => {
                let params: TargetParams = parse_params(params)?;
                let statuses = self.registry.status(&Target::kind(kind, params.name))?;
                wrap("statuses", statuses)
            }
            Method::Reading(kind) => {
                let params: ReadingParams = parse_params(params)?;
                let statuses = self
                    .registry
                    .set_enabled(&Target::kind(kind, params.name), params.enabled)
                    .await?;
                wrap("statuses", statuses)
            }
        }
    }

    async fn run(&self, target: Target, command: Command) -> Result<Value, RpcError> {
        let results = self.registry.dispatch(&target, command).await?;
        wrap("results", results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherSettings;
    use crate::testing::{DuplexOpener, answer};
    use sensord_domain::sensor::SensorConfig;

    struct Fixture {
        opener: Arc<DuplexOpener>,
        service: ControlService<Arc<DuplexOpener>>,
    }

    async fn fixture(sensors: &[(&str, SensorKind)]) -> Fixture {
        let opener = Arc::new(DuplexOpener::default());
        let dispatcher = Arc::new(EventDispatcher::new(DispatcherSettings::default()));
        let registry = Arc::new(SensorRegistry::new(
            Arc::clone(&opener),
            Arc::clone(&dispatcher),
        ));
        for (name, kind) in sensors {
            let config = SensorConfig::new(*name, *kind, format!("/dev/{name}"));
            registry.register(config, Vec::new()).await.unwrap();
        }
        Fixture {
            opener,
            service: ControlService::new(registry, dispatcher),
        }
    }

    async fn call(service: &ControlService<Arc<DuplexOpener>>, line: &str) -> RpcResponse {
        service.handle_line(line).await.into_response()
    }

    fn error_code(response: &RpcResponse) -> i64 {
        response.error.as_ref().map(|error| error.code).unwrap()
    }

    #[tokio::test]
    async fn should_answer_ping() {
        let fixture = fixture(&[]).await;
        let response = call(&fixture.service, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).await;
        assert_eq!(response.id, json!(1));
        assert_eq!(response.result, Some(json!("pong")));
    }

    #[tokio::test]
    async fn should_report_parse_error_with_null_id() {
        let fixture = fixture(&[]).await;
        let response = call(&fixture.service, "{not json").await;
        assert_eq!(response.id, Value::Null);
        assert_eq!(error_code(&response), codes::PARSE_ERROR);
    }

    #[tokio::test]
    async fn should_report_invalid_request_without_method() {
        let fixture = fixture(&[]).await;
        let response = call(&fixture.service, r#"{"jsonrpc":"2.0","id":2}"#).await;
        assert_eq!(response.id, json!(2));
        assert_eq!(error_code(&response), codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn should_report_unknown_method() {
        let fixture = fixture(&[]).await;
        for method in ["sen9999.command", "sen0395.fly", "reboot"] {
            let line = json!({"jsonrpc": "2.0", "id": 3, "method": method}).to_string();
            let response = call(&fixture.service, &line).await;
            assert_eq!(error_code(&response), codes::METHOD_NOT_FOUND, "{method}");
        }
    }

    #[tokio::test]
    async fn should_report_unknown_command() {
        let fixture = fixture(&[("desk", SensorKind::Sen0395)]).await;
        let response = call(
            &fixture.service,
            r#"{"jsonrpc":"2.0","id":4,"method":"sen0395.command","params":{"command":"fly"}}"#,
        )
        .await;
        assert_eq!(error_code(&response), codes::UNKNOWN_COMMAND);
    }

    #[tokio::test]
    async fn should_report_invalid_arguments() {
        let fixture = fixture(&[("desk", SensorKind::Sen0395)]).await;
        let response = call(
            &fixture.service,
            r#"{"jsonrpc":"2.0","id":5,"method":"sen0395.command","params":{"command":"sensitivity","args":[12]}}"#,
        )
        .await;
        assert_eq!(error_code(&response), codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn should_report_missing_command_param() {
        let fixture = fixture(&[("desk", SensorKind::Sen0395)]).await;
        let response = call(
            &fixture.service,
            r#"{"jsonrpc":"2.0","id":6,"method":"sen0395.command"}"#,
        )
        .await;
        assert_eq!(error_code(&response), codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn should_reject_non_config_command_on_configure() {
        let fixture = fixture(&[("desk", SensorKind::Sen0395)]).await;
        let response = call(
            &fixture.service,
            r#"{"jsonrpc":"2.0","id":7,"method":"sen0395.configure","params":{"command":"start"}}"#,
        )
        .await;
        assert_eq!(error_code(&response), codes::NOT_A_CONFIG_COMMAND);
    }

    #[tokio::test]
    async fn should_report_no_sensors_for_empty_group() {
        let fixture = fixture(&[("desk", SensorKind::Sen0395)]).await;
        let response = call(
            &fixture.service,
            r#"{"jsonrpc":"2.0","id":8,"method":"sen0311.status"}"#,
        )
        .await;
        assert_eq!(error_code(&response), codes::NO_SENSORS);
    }

    #[tokio::test]
    async fn should_report_unknown_sensor_name() {
        let fixture = fixture(&[("desk", SensorKind::Sen0395)]).await;
        let response = call(
            &fixture.service,
            r#"{"jsonrpc":"2.0","id":9,"method":"sen0395.status","params":{"name":"attic"}}"#,
        )
        .await;
        assert_eq!(error_code(&response), codes::SENSOR_NOT_FOUND);
        assert_eq!(response.error.unwrap().message, "sensor attic not found");
    }

    #[tokio::test]
    async fn should_return_status_of_group() {
        let fixture = fixture(&[
            ("desk", SensorKind::Sen0395),
            ("hall", SensorKind::Sen0311),
        ])
        .await;
        let response = call(
            &fixture.service,
            r#"{"jsonrpc":"2.0","id":10,"method":"sen0311.status"}"#,
        )
        .await;
        let result = response.into_result().unwrap();
        let statuses = result["statuses"].as_array().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0]["sensor_id"], json!("sen0311/hall"));
        assert_eq!(statuses[0]["lifecycle"]["state"], json!("scanning"));
    }

    #[tokio::test]
    async fn should_run_command_and_return_result_per_sensor() {
        let fixture = fixture(&[("desk", SensorKind::Sen0395)]).await;
        let mut device = fixture.opener.take("desk");

        let (response, ()) = tokio::join!(
            call(
                &fixture.service,
                r#"{"jsonrpc":"2.0","id":11,"method":"sen0395.command","params":{"name":"desk","command":"start"}}"#,
            ),
            answer(&mut device, "sensorStart", b"Done\n"),
        );

        let result = response.into_result().unwrap();
        let results = result["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["sensor_id"], json!("sen0395/desk"));
        assert_eq!(results[0]["outcome"], json!("confirmed"));
    }

    #[tokio::test]
    async fn should_disable_reading() {
        let fixture = fixture(&[("hall", SensorKind::Sen0311)]).await;
        let response = call(
            &fixture.service,
            r#"{"jsonrpc":"2.0","id":12,"method":"sen0311.reading","params":{"enabled":false}}"#,
        )
        .await;
        let result = response.into_result().unwrap();
        assert_eq!(result["statuses"][0]["enabled"], json!(false));
        assert_eq!(result["statuses"][0]["lifecycle"]["state"], json!("disabled"));
    }

    #[tokio::test]
    async fn should_switch_to_subscription() {
        let fixture = fixture(&[]).await;
        let reply = fixture
            .service
            .handle_line(r#"{"jsonrpc":"2.0","id":13,"method":"events.subscribe"}"#)
            .await;
        assert!(matches!(reply, ControlReply::Subscribe(_)));
        assert_eq!(reply.response().result, Some(json!({"subscribed": true})));
    }

    #[test]
    fn should_skip_absent_fields_in_response() {
        let response = RpcResponse::success(json!(1), json!("pong"));
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"jsonrpc": "2.0", "id": 1, "result": "pong"})
        );
    }
}
