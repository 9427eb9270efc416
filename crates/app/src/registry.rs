//! Sensor registry: the name-to-instance map and the uniform control
//! surface over all sensors.
//!
//! The map is the only structure shared across tasks and is guarded by a
//! short-lived lock; commands are handed to each instance's own task, so a
//! slow sensor never holds the registry.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::task::JoinSet;

use sensord_domain::command::{
    Command, CommandOutcome, CommandRequest, CommandResult, FailureKind,
};
use sensord_domain::error::{NotFoundError, SensordError, ValidationError};
use sensord_domain::sensor::{LifecycleState, SensorConfig, SensorId, SensorKind, SensorStatus};

use crate::devices::protocol_for;
use crate::dispatcher::{EventDispatcher, SinkHandle};
use crate::instance::{self, InstanceContext, InstanceHandle};
use crate::ports::TransportOpener;

/// How long autostart watches for readings before issuing `start`.
const AUTOSTART_PROBE: Duration = Duration::from_secs(1);

/// Which sensors a request addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    /// Restrict to one device family.
    pub kind: Option<SensorKind>,
    /// Restrict to one sensor; `None` addresses all of them.
    pub name: Option<String>,
}

impl Target {
    /// Every registered sensor.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// One sensor by name.
    #[must_use]
    pub fn sensor(name: impl Into<String>) -> Self {
        Self {
            kind: None,
            name: Some(name.into()),
        }
    }

    /// Sensors of one family, optionally narrowed to one name.
    #[must_use]
    pub fn kind(kind: SensorKind, name: Option<String>) -> Self {
        Self {
            kind: Some(kind),
            name,
        }
    }
}

/// Owns every sensor instance.
pub struct SensorRegistry<O> {
    opener: O,
    dispatcher: Arc<EventDispatcher>,
    sensors: RwLock<BTreeMap<String, Arc<InstanceHandle>>>,
}

impl<O: TransportOpener> SensorRegistry<O> {
    pub fn new(opener: O, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            opener,
            dispatcher,
            sensors: RwLock::new(BTreeMap::new()),
        }
    }

    /// Build and start the instance for `config`.
    ///
    /// A transport that fails to open leaves the sensor registered in the
    /// error state. When `autostart` and `enabled` are set, `start` is issued
    /// in the background.
    ///
    /// # Errors
    ///
    /// Returns [`SensordError::Validation`] when the configuration is invalid
    /// or the name is already taken.
    #[tracing::instrument(skip_all, fields(sensor = %config.id()))]
    pub async fn register(
        &self,
        config: SensorConfig,
        sinks: Vec<SinkHandle>,
    ) -> Result<SensorId, SensordError> {
        config.validate()?;
        if self.contains(&config.name) {
            return Err(ValidationError::DuplicateSensor(config.name).into());
        }

        let baud_rate = config
            .baud_rate
            .unwrap_or_else(|| protocol_for(&config).default_baud_rate());
        let transport = match self.opener.open(&config, baud_rate).await {
            Ok(transport) => Ok(transport),
            Err(err) => {
                let reason = err.to_string();
                let source = std::error::Error::source(&err).map(ToString::to_string);
                tracing::warn!(
                    transport = %config.transport,
                    %reason,
                    source = source.as_deref().unwrap_or_default(),
                    "unable to open transport"
                );
                Err(source.unwrap_or(reason))
            }
        };

        let autostart = config.autostart && config.enabled;
        let name = config.name.clone();
        let handle = Arc::new(instance::spawn(
            InstanceContext {
                config,
                dispatcher: Arc::clone(&self.dispatcher),
                sinks,
            },
            transport,
        ));
        let id = handle.id().clone();

        let inserted = {
            let mut sensors = self.sensors.write().unwrap_or_else(PoisonError::into_inner);
            if sensors.contains_key(&name) {
                false
            } else {
                sensors.insert(name.clone(), Arc::clone(&handle));
                true
            }
        };
        if !inserted {
            handle.shutdown().await;
            return Err(ValidationError::DuplicateSensor(name).into());
        }
        tracing::info!(sinks = handle.config().sinks.len(), "sensor registered");

        if autostart {
            tokio::spawn(autostart_sensor(handle));
        }
        Ok(id)
    }

    fn contains(&self, name: &str) -> bool {
        self.sensors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered sensor ids, ordered by name.
    #[must_use]
    pub fn sensor_ids(&self) -> Vec<SensorId> {
        self.sensors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|handle| handle.id().clone())
            .collect()
    }

    /// Instances addressed by `target`, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns [`NotFoundError::Sensor`] when a named sensor does not exist
    /// (or belongs to another family), [`NotFoundError::NoSensors`] when
    /// nothing matches.
    pub fn resolve(&self, target: &Target) -> Result<Vec<Arc<InstanceHandle>>, SensordError> {
        let sensors = self.sensors.read().unwrap_or_else(PoisonError::into_inner);
        let kind_matches = |handle: &InstanceHandle| {
            target
                .kind
                .is_none_or(|kind| handle.id().kind == kind)
        };
        if let Some(name) = &target.name {
            return match sensors.get(name) {
                Some(handle) if kind_matches(handle) => Ok(vec![Arc::clone(handle)]),
                _ => Err(NotFoundError::Sensor(name.clone()).into()),
            };
        }
        let matched: Vec<_> = sensors
            .values()
            .filter(|handle| kind_matches(handle))
            .cloned()
            .collect();
        if matched.is_empty() {
            return Err(NotFoundError::NoSensors.into());
        }
        Ok(matched)
    }

    /// Apply `command` to every addressed sensor in parallel and collect one
    /// result per sensor, in name order.
    ///
    /// A failing or unresponsive sensor only affects its own result.
    ///
    /// # Errors
    ///
    /// Returns [`SensordError::NotFound`] when the target matches nothing.
    #[tracing::instrument(skip(self, command), fields(command = %command))]
    pub async fn dispatch(
        &self,
        target: &Target,
        command: Command,
    ) -> Result<Vec<CommandResult>, SensordError> {
        let handles = self.resolve(target)?;
        let mut set = JoinSet::new();
        for (idx, handle) in handles.iter().enumerate() {
            let handle = Arc::clone(handle);
            let request = CommandRequest::new(handle.id().name.clone(), command.clone());
            set.spawn(async move { (idx, handle.submit(request).await) });
        }

        let mut results: Vec<Option<CommandResult>> = vec![None; handles.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, result)) => results[idx] = Some(result),
                Err(err) => tracing::error!(%err, "command task failed"),
            }
        }

        Ok(results
            .into_iter()
            .zip(&handles)
            .map(|(result, handle)| {
                result.unwrap_or_else(|| {
                    CommandResult::complete(
                        handle.id().clone(),
                        CommandRequest::new(handle.id().name.clone(), command.clone()),
                        CommandOutcome::failed(FailureKind::Transport(
                            "command task failed".to_string(),
                        )),
                    )
                })
            })
            .collect())
    }

    /// Current status of every addressed sensor. No side effects.
    ///
    /// # Errors
    ///
    /// Returns [`SensordError::NotFound`] when the target matches nothing.
    pub fn status(&self, target: &Target) -> Result<Vec<SensorStatus>, SensordError> {
        Ok(self
            .resolve(target)?
            .iter()
            .map(|handle| handle.status())
            .collect())
    }

    /// Toggle sample processing on every addressed sensor.
    ///
    /// # Errors
    ///
    /// Returns [`SensordError::NotFound`] when the target matches nothing.
    #[tracing::instrument(skip(self))]
    pub async fn set_enabled(
        &self,
        target: &Target,
        enabled: bool,
    ) -> Result<Vec<SensorStatus>, SensordError> {
        let handles = self.resolve(target)?;
        let mut set = JoinSet::new();
        for (idx, handle) in handles.iter().enumerate() {
            let handle = Arc::clone(handle);
            set.spawn(async move { (idx, handle.set_enabled(enabled).await) });
        }

        let mut statuses: Vec<Option<SensorStatus>> = vec![None; handles.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, status)) => statuses[idx] = Some(status),
                Err(err) => tracing::error!(%err, "reading toggle task failed"),
            }
        }

        Ok(statuses
            .into_iter()
            .zip(&handles)
            .map(|(status, handle)| status.unwrap_or_else(|| handle.status()))
            .collect())
    }

    /// Stop every instance and close its transport.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = std::mem::take(
            &mut *self.sensors.write().unwrap_or_else(PoisonError::into_inner),
        )
        .into_values()
        .collect();
        for handle in handles {
            handle.shutdown().await;
            tracing::debug!(sensor = %handle.id(), "sensor unregistered");
        }
    }
}

#[tracing::instrument(skip_all, fields(sensor = %handle.id()))]
async fn autostart_sensor(handle: Arc<InstanceHandle>) {
    let mut status = handle.watch_status();
    // The watch guard must be released before the next await: the sensor
    // task needs the write side to update its status.
    let already_scanning = tokio::time::timeout(
        AUTOSTART_PROBE,
        status.wait_for(|status| status.lifecycle == LifecycleState::Scanning),
    )
    .await
    .is_ok_and(|observed| observed.is_ok());
    if already_scanning {
        tracing::info!(result = "already_scanning", "autostart");
        return;
    }
    if handle.status().lifecycle.is_error() {
        tracing::warn!(result = "failed", "autostart skipped, sensor in error state");
        return;
    }

    let request = CommandRequest::new(handle.id().name.clone(), Command::Start);
    let result = handle.submit(request).await;
    if result.outcome.is_confirmed() {
        tracing::info!(result = "started", "autostart");
    } else {
        tracing::warn!(result = "failed", response = %result.outcome, "autostart");
    }
}
