//! Launch options passed to the controller on start.

use serde_json::{Map, Value};
use tracing::error;

use crate::tunnel::types::{LaunchSource, NextRelay, SelectorResult};

/// Key holding a boolean that is true when an on-demand rule started the tunnel.
pub const IS_ON_DEMAND_KEY: &str = "is-on-demand";

/// Key holding a JSON-encoded [`SelectorResult`] chosen by the app.
pub const SELECTOR_RESULT_KEY: &str = "relay-selector-result";

/// Raw launch parameters as delivered by the host VPN framework.
#[derive(Debug, Clone, Default)]
pub struct RawStartOptions(Map<String, Value>);

impl RawStartOptions {
    pub fn new() -> Self {
        RawStartOptions::default()
    }

    /// Wrap an existing JSON object.
    pub fn from_map(map: Map<String, Value>) -> Self {
        RawStartOptions(map)
    }

    /// Mark the launch as triggered by an on-demand rule.
    pub fn with_on_demand(mut self, on_demand: bool) -> Self {
        self.0
            .insert(IS_ON_DEMAND_KEY.to_string(), Value::Bool(on_demand));
        self
    }

    /// Embed a relay pick made by the app.
    pub fn with_selector_result(
        mut self,
        selector_result: &SelectorResult,
    ) -> Result<Self, serde_json::Error> {
        let encoded = serde_json::to_string(selector_result)?;
        self.0
            .insert(SELECTOR_RESULT_KEY.to_string(), Value::String(encoded));
        Ok(self)
    }

    pub fn is_on_demand(&self) -> bool {
        self.0
            .get(IS_ON_DEMAND_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Decode the embedded selector result, if present.
    pub fn selector_result(&self) -> Result<Option<SelectorResult>, serde_json::Error> {
        match self.0.get(SELECTOR_RESULT_KEY) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(encoded)) => serde_json::from_str(encoded).map(Some),
            Some(other) => serde_json::from_value(other.clone()).map(Some),
        }
    }
}

/// Parsed start options; immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    pub launch_source: LaunchSource,
    pub preselected_relay: Option<SelectorResult>,
}

impl StartOptions {
    pub fn new(launch_source: LaunchSource) -> Self {
        StartOptions {
            launch_source,
            preselected_relay: None,
        }
    }

    pub fn with_relay(mut self, selector_result: SelectorResult) -> Self {
        self.preselected_relay = Some(selector_result);
        self
    }

    /// Map raw launch parameters to start options.
    ///
    /// A relay embedded by the app implies an app launch. Without one the
    /// launch came from an on-demand rule or the system. A relay that fails to
    /// decode is logged and dropped.
    pub fn parse(raw: &RawStartOptions) -> Self {
        let on_demand = raw.is_on_demand();

        match raw.selector_result() {
            Ok(Some(selector_result)) => {
                StartOptions::new(LaunchSource::App).with_relay(selector_result)
            }
            Ok(None) if on_demand => StartOptions::new(LaunchSource::OnDemand),
            Ok(None) => StartOptions::new(LaunchSource::System),
            Err(e) => {
                error!(error = %e, "Failed to decode relay selector result passed from the app");
                let source = if on_demand {
                    LaunchSource::OnDemand
                } else {
                    LaunchSource::App
                };
                StartOptions::new(source)
            }
        }
    }

    /// Relay choice for the initial configuration.
    pub fn next_relay(&self) -> NextRelay {
        self.preselected_relay
            .clone()
            .map(NextRelay::Fixed)
            .unwrap_or(NextRelay::Automatic)
    }
}

impl From<&RawStartOptions> for StartOptions {
    fn from(raw: &RawStartOptions) -> Self {
        StartOptions::parse(raw)
    }
}
