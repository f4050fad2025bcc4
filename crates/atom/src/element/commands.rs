//! The command server half of an element: the handler registry and the
//! dispatch loop over the element's command inbox.

use super::Element;
use crate::config::{
    command_key, response_key, version_float, COMMAND_LIST_COMMAND, HEALTHCHECK_COMMAND, LANG,
    MAX_BLOCK_MS, RESERVED_COMMANDS, RESPONSE_TIMEOUT_MS, STREAM_LEN, VERSION_COMMAND,
};
use crate::messages::{Acknowledge, Command, LogLevel, Response};
use crate::nucleus::RawEntry;
use crate::serialization::{Datum, Serialization};
use crate::{codes, Error, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Extras of a command, keyed by their wire names.
pub type Extras = BTreeMap<String, Bytes>;

type HandlerFn =
    Arc<dyn Fn(Datum, Extras) -> BoxFuture<'static, anyhow::Result<Response>> + Send + Sync>;

/// What `command_add` records per command: the handler capability, the
/// body-codec choice for its input, and the response timeout advertised in
/// acknowledgements.
#[derive(Clone)]
pub(super) struct CommandSpec {
    handler: HandlerFn,
    deserialization: Serialization,
    timeout_ms: u64,
}

impl Element {
    /// Register a command for peers to call. Reserved names are refused;
    /// use [`Element::healthcheck_set`] to replace the healthcheck.
    pub fn command_add<F, Fut>(
        &self,
        name: &str,
        handler: F,
        timeout_ms: u64,
        deserialization: Serialization,
    ) -> Result<()>
    where
        F: Fn(Datum, Extras) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
    {
        if RESERVED_COMMANDS.contains(&name) {
            return Err(Error::ReservedCommand(name.to_string()));
        }
        let spec = CommandSpec {
            handler: Arc::new(move |data, extras| handler(data, extras).boxed()),
            deserialization,
            timeout_ms,
        };
        self.inner
            .handlers
            .write()
            .unwrap()
            .insert(name.to_string(), spec);
        Ok(())
    }

    /// Replace the healthcheck. The handler should return a success
    /// Response while the element is healthy.
    pub fn healthcheck_set<F, Fut>(&self, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
    {
        let spec = CommandSpec {
            handler: Arc::new(move |_data, _extras| handler().boxed()),
            deserialization: Serialization::None,
            timeout_ms: RESPONSE_TIMEOUT_MS,
        };
        self.inner
            .handlers
            .write()
            .unwrap()
            .insert(HEALTHCHECK_COMMAND.to_string(), spec);
    }

    /// Serve commands until the token is cancelled: read the oldest new
    /// inbox entry, acknowledge it, run the handler, respond. Handler
    /// failures become `CALLBACK_FAILED` responses; the loop keeps going.
    pub async fn command_loop(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            let cursor = { self.inner.command_last_id.lock().unwrap().to_string() };
            let cursors = [(command_key(&self.inner.name), cursor)];
            let read = self
                .inner
                .nucleus
                .stream_read(&cursors, Some(1), Some(MAX_BLOCK_MS));

            let chunks = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                result = read => result?,
            };

            let Some(entry) = chunks.into_iter().flat_map(|chunk| chunk.entries).next() else {
                continue;
            };
            {
                *self.inner.command_last_id.lock().unwrap() = entry.id;
            }
            self.dispatch(entry).await?;
        }
    }

    async fn dispatch(&self, entry: RawEntry) -> Result<()> {
        let cmd_id = entry.id;
        // Inbox entries that aren't commands (such as presence records)
        // are skipped.
        let Some(command) = Command::from_map(&entry.fields) else {
            return Ok(());
        };
        if command.element.is_empty() {
            self.log(LogLevel::Err, "No caller name present in command!")
                .await?;
            return Ok(());
        }

        let spec = {
            self.inner
                .handlers
                .read()
                .unwrap()
                .get(&command.cmd)
                .cloned()
        };
        let timeout_ms = spec.as_ref().map_or(RESPONSE_TIMEOUT_MS, |spec| spec.timeout_ms);

        let inbox = response_key(&command.element);
        let ack = Acknowledge {
            element: self.inner.name.clone(),
            cmd_id,
            timeout_ms,
        };
        self.inner
            .nucleus
            .stream_add(&inbox, &ack.to_fields(), STREAM_LEN)
            .await?;

        let response = self.run_command(&command, spec).await;
        self.inner
            .nucleus
            .stream_add(
                &inbox,
                &response.to_fields(&self.inner.name, &command.cmd, cmd_id),
                STREAM_LEN,
            )
            .await?;
        Ok(())
    }

    async fn run_command(&self, command: &Command, spec: Option<CommandSpec>) -> Response {
        match command.cmd.as_str() {
            VERSION_COMMAND => version_response(),
            COMMAND_LIST_COMMAND => self.command_list_response(),
            name => {
                let Some(spec) = spec else {
                    self.log(LogLevel::Err, "Received unsupported command.")
                        .await
                        .ok();
                    return Response::error(codes::COMMAND_UNSUPPORTED, "Unsupported command.");
                };

                // Reserved commands don't care what data is being sent.
                let (data, extras) = if name == HEALTHCHECK_COMMAND {
                    (Datum::empty(), Extras::new())
                } else {
                    let data = match decode_command_data(&command.data, spec.deserialization) {
                        Ok(data) => data,
                        Err(error) => {
                            return Response::error(
                                codes::COMMAND_INVALID_DATA,
                                format!("could not decode data for {name}: {error}"),
                            )
                        }
                    };
                    (data, command.extras.clone())
                };

                let invocation = (spec.handler)(data, extras);
                match AssertUnwindSafe(invocation).catch_unwind().await {
                    Ok(Ok(mut response)) => {
                        // Handler error codes live in the user range on the wire.
                        if response.err_code != codes::NO_ERROR {
                            response.err_code += codes::USER_ERRORS_BEGIN;
                        }
                        response
                    }
                    Ok(Err(error)) => Response::error(
                        codes::CALLBACK_FAILED,
                        format!("{name} failed: {error:#}"),
                    ),
                    Err(_) => {
                        Response::error(codes::CALLBACK_FAILED, format!("{name} panicked"))
                    }
                }
            }
        }
    }

    fn command_list_response(&self) -> Response {
        let mut names: Vec<String> = {
            self.inner
                .handlers
                .read()
                .unwrap()
                .keys()
                .filter(|name| !RESERVED_COMMANDS.contains(&name.as_str()))
                .cloned()
                .collect()
        };
        names.sort();
        Response::serialized(&names, Serialization::Msgpack)
            .unwrap_or_else(|_| Response::error(codes::INTERNAL_ERROR, "could not encode command list"))
    }
}

fn version_response() -> Response {
    let body = serde_json::json!({ "language": LANG, "version": version_float() });
    Response::serialized(&body, Serialization::Msgpack)
        .unwrap_or_else(|_| Response::error(codes::INTERNAL_ERROR, "could not encode version"))
}

fn decode_command_data(data: &Bytes, method: Serialization) -> Result<Datum> {
    if method == Serialization::None || data.is_empty() {
        return Ok(Datum::Bytes(data.clone()));
    }
    Ok(Datum::Value(method.decode_value(data)?))
}
