//! The element runtime: a named, long-lived participant in the messaging
//! fabric. An `Element` is cheaply cloneable and usable from many tasks;
//! all coordination happens in the nucleus.

use crate::config::{
    command_key, response_key, stream_key, NucleusConfig, COMMAND_LIST_COMMAND,
    COMMAND_LIST_MIN_VERSION, HEALTHCHECK_COMMAND, HEALTHCHECK_MIN_VERSION, LANG, LOG_STREAM,
    STREAM_LEN, VERSION, VERSION_COMMAND,
};
use crate::messages::{EntryId, Log, LogLevel, Response};
use crate::nucleus::Nucleus;
use crate::serialization::{Datum, Serialization};
use crate::{codes, Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

mod commands;
mod reference;
mod send;
mod streams;

pub use commands::Extras;
pub use send::SendOptions;
pub use streams::{ReadFrom, StreamHandler, WriteOptions};

use commands::CommandSpec;

const STREAM_REFERENCE_SCRIPT: &str = include_str!("../scripts/stream_reference.lua");

#[derive(Clone)]
pub struct Element {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    host: String,
    nucleus: Nucleus,
    /// Last response-inbox id any sender in this process has folded back.
    /// Advanced only when the candidate is strictly newer in (ms, seq).
    response_last_id: Mutex<EntryId>,
    /// Cursor of the dispatch loop over the command inbox.
    command_last_id: Mutex<EntryId>,
    /// Streams this element has published and therefore owns.
    streams: Mutex<BTreeSet<String>>,
    handlers: RwLock<HashMap<String, CommandSpec>>,
    /// SHA of the preloaded stream→reference script, if loading succeeded.
    stream_reference_sha: Option<String>,
}

impl std::fmt::Debug for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Element")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Element {
    /// Connect to the nucleus and announce this element: presence records
    /// are appended to its response and command inboxes, the reserved
    /// commands are registered, and the stream→reference script is loaded.
    pub async fn connect(name: impl Into<String>, config: &NucleusConfig) -> Result<Element> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::EmptyElementName);
        }

        let nucleus = Nucleus::connect(config).await?;
        let host = hostname::get()
            .map(|host| host.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        let presence: Vec<(String, Vec<u8>)> = vec![
            ("language".to_string(), LANG.as_bytes().to_vec()),
            ("version".to_string(), VERSION.as_bytes().to_vec()),
        ];
        let response_last_id = nucleus
            .stream_add(&response_key(&name), &presence, STREAM_LEN)
            .await?;
        let command_last_id = nucleus
            .stream_add(&command_key(&name), &presence, STREAM_LEN)
            .await?;

        let stream_reference_sha = match nucleus.script_load(STREAM_REFERENCE_SCRIPT).await {
            Ok(sha) => Some(sha),
            Err(error) => {
                tracing::error!(%error, "failed to load the stream reference script");
                None
            }
        };

        let element = Element {
            inner: Arc::new(Inner {
                name,
                host,
                nucleus,
                response_last_id: Mutex::new(response_last_id),
                command_last_id: Mutex::new(command_last_id),
                streams: Mutex::new(BTreeSet::new()),
                handlers: RwLock::new(HashMap::new()),
                stream_reference_sha,
            }),
        };

        // A healthy default until the owner installs their own check.
        element.healthcheck_set(|| async { Ok(Response::default()) });
        element.log(LogLevel::Info, "Element initialized.").await?;
        Ok(element)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// The underlying broker adapter, for layers (such as queues) built
    /// directly on nucleus primitives.
    pub fn nucleus(&self) -> &Nucleus {
        &self.inner.nucleus
    }

    /// Delete everything this element owns in the nucleus: its published
    /// streams, then its response and command inboxes. Prefer calling this
    /// over letting the element fall out of scope.
    pub async fn close(&self) -> Result<()> {
        let streams: Vec<String> = {
            let owned = self.inner.streams.lock().unwrap();
            owned.iter().cloned().collect()
        };
        for stream in streams {
            self.clean_up_stream(&stream).await?;
        }
        self.inner
            .nucleus
            .stream_delete(&response_key(&self.inner.name))
            .await?;
        self.inner
            .nucleus
            .stream_delete(&command_key(&self.inner.name))
            .await?;
        Ok(())
    }

    /// Delete one owned stream.
    pub async fn clean_up_stream(&self, stream: &str) -> Result<()> {
        let owned = self.inner.streams.lock().unwrap().remove(stream);
        if !owned {
            return Err(Error::UnknownStream(stream.to_string()));
        }
        self.inner
            .nucleus
            .stream_delete(&stream_key(&self.inner.name, stream))
            .await
    }

    /// Append a record to the global log stream and mirror it to tracing.
    pub async fn log(&self, level: LogLevel, msg: &str) -> Result<()> {
        let record = Log {
            element: self.inner.name.clone(),
            host: self.inner.host.clone(),
            level,
            msg: msg.to_string(),
        };
        self.inner
            .nucleus
            .stream_add(LOG_STREAM, &record.to_fields(), STREAM_LEN)
            .await?;

        match level.tracing_level() {
            tracing::Level::ERROR => tracing::error!(element = %self.inner.name, "{msg}"),
            tracing::Level::WARN => tracing::warn!(element = %self.inner.name, "{msg}"),
            tracing::Level::INFO => tracing::info!(element = %self.inner.name, "{msg}"),
            _ => tracing::debug!(element = %self.inner.name, "{msg}"),
        }
        Ok(())
    }

    /// Fold a response-inbox id into the process-wide cursor. Many senders
    /// share the inbox, so the cursor only ever moves forward.
    pub(crate) fn update_response_id_if_newer(&self, candidate: EntryId) {
        let mut last = self.inner.response_last_id.lock().unwrap();
        if candidate > *last {
            *last = candidate;
        }
    }

    // ---- introspection ----

    /// Names of all elements currently announced in the nucleus.
    pub async fn get_all_elements(&self) -> Result<Vec<String>> {
        let keys = self.inner.nucleus.scan_keys(&response_key("*")).await?;
        let mut names: Vec<String> = keys
            .iter()
            .filter_map(|key| key.rsplit(':').next())
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Stream keys owned by the given element, or by all elements.
    pub async fn get_all_streams(&self, element: Option<&str>) -> Result<Vec<String>> {
        let pattern = stream_key(element.unwrap_or("*"), "*");
        let mut keys = self.inner.nucleus.scan_keys(&pattern).await?;
        keys.sort();
        Ok(keys)
    }

    /// `element:command` pairs advertised by peers that support command
    /// listing. The caller itself is skipped.
    pub async fn get_all_commands(&self, element: Option<&str>) -> Result<Vec<String>> {
        let elements = match element {
            Some(element) => vec![element.to_string()],
            None => self.get_all_elements().await?,
        };

        let mut commands = Vec::new();
        for peer in elements {
            if peer == self.inner.name {
                continue;
            }
            if !self
                .check_element_version(&peer, Some(&[LANG]), Some(COMMAND_LIST_MIN_VERSION))
                .await
            {
                continue;
            }
            let options = SendOptions {
                deserialization: Serialization::Msgpack,
                ..Default::default()
            };
            let response = self
                .command_send(&peer, COMMAND_LIST_COMMAND, Datum::empty(), &options)
                .await?;
            if !response.is_ok() {
                continue;
            }
            if let Ok(names) = response.data.decode::<Vec<String>>(Serialization::Msgpack) {
                commands.extend(names.into_iter().map(|name| format!("{peer}:{name}")));
            }
        }
        Ok(commands)
    }

    // ---- health & version ----

    /// Query a peer's language and wire version.
    pub async fn get_element_version(&self, element: &str) -> Result<Response> {
        let options = SendOptions {
            deserialization: Serialization::Msgpack,
            ..Default::default()
        };
        self.command_send(element, VERSION_COMMAND, Datum::empty(), &options)
            .await
    }

    /// Whether a peer is reachable and meets the given language and
    /// minimum-version gates.
    pub async fn check_element_version(
        &self,
        element: &str,
        languages: Option<&[&str]>,
        min_version: Option<f64>,
    ) -> bool {
        let Ok(response) = self.get_element_version(element).await else {
            return false;
        };
        if response.err_code != codes::NO_ERROR {
            return false;
        }
        let Some(info) = response.data.as_value().and_then(|value| value.as_object()) else {
            return false;
        };
        let Some(version) = info.get("version").and_then(|value| value.as_f64()) else {
            return false;
        };
        let Some(language) = info.get("language").and_then(|value| value.as_str()) else {
            return false;
        };
        if let Some(languages) = languages {
            if !languages.contains(&language) {
                return false;
            }
        }
        if let Some(min_version) = min_version {
            if version < min_version {
                return false;
            }
        }
        true
    }

    /// Block until every listed element passes its healthcheck. Each sweep
    /// gates on version support first; in strict mode an unreachable or
    /// unsupported peer counts as unhealthy, otherwise it is skipped. Any
    /// failure sleeps `retry` and restarts the sweep from the top.
    pub async fn wait_for_elements_healthy(
        &self,
        elements: &[&str],
        retry: Duration,
        strict: bool,
    ) -> Result<()> {
        loop {
            let mut all_healthy = true;
            for &element in elements {
                if !self
                    .check_element_version(element, Some(&[LANG]), Some(HEALTHCHECK_MIN_VERSION))
                    .await
                {
                    if strict {
                        self.log(
                            LogLevel::Warning,
                            &format!("Failed healthcheck on {element}, retrying..."),
                        )
                        .await?;
                        all_healthy = false;
                        break;
                    }
                    continue;
                }

                let response = self
                    .command_send(
                        element,
                        HEALTHCHECK_COMMAND,
                        Datum::empty(),
                        &SendOptions::default(),
                    )
                    .await?;
                if !response.is_ok() {
                    self.log(
                        LogLevel::Warning,
                        &format!("Failed healthcheck on {element}, retrying..."),
                    )
                    .await?;
                    all_healthy = false;
                    break;
                }
            }
            if all_healthy {
                return Ok(());
            }
            tokio::time::sleep(retry).await;
        }
    }
}
