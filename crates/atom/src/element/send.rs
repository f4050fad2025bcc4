//! The command client half of an element: send a command, wait for its
//! acknowledgement, then wait for its response, each under its own soft
//! deadline.

use super::Element;
use crate::config::{command_key, response_key, ACK_TIMEOUT, STREAM_LEN};
use crate::messages::{Command, EntryId, LogLevel, Response};
use crate::serialization::{Datum, Serialization};
use crate::{codes, Result};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Codec applied to the outgoing data.
    pub serialization: Serialization,
    /// Codec attempted on the response data; failures fall back to raw
    /// bytes with a warning.
    pub deserialization: Serialization,
    /// How long to wait for the callee's acknowledgement. The response
    /// deadline comes from the acknowledgement itself.
    pub ack_timeout: Duration,
    /// Extra key/value pairs forwarded to the handler. Reserved envelope
    /// keys are refused at send time.
    pub extras: BTreeMap<String, Bytes>,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions {
            serialization: Serialization::None,
            deserialization: Serialization::None,
            ack_timeout: ACK_TIMEOUT,
            extras: BTreeMap::new(),
        }
    }
}

impl Element {
    /// Invoke `cmd` on `callee` and wait for its response.
    ///
    /// Timeouts are not errors: an unacknowledged command returns a
    /// `COMMAND_NO_ACK` response and an unanswered one returns
    /// `COMMAND_NO_RESPONSE`. `Err` is reserved for nucleus and envelope
    /// failures.
    ///
    /// Many senders share one response inbox, so this call matches entries
    /// on `(callee, cmd_id)`, advances a cursor local to the call, and only
    /// folds it into the shared process-wide cursor when strictly newer.
    pub async fn command_send(
        &self,
        callee: &str,
        cmd: &str,
        data: impl Into<Datum>,
        options: &SendOptions,
    ) -> Result<Response> {
        // Snapshot before the command is appended, so the inbox scan cannot
        // miss an acknowledgement that lands immediately.
        let mut cursor = { *self.inner.response_last_id.lock().unwrap() };

        let wire_data = data.into().to_wire(options.serialization)?;
        let command = Command::new(
            self.inner.name.clone(),
            cmd,
            wire_data,
            options.extras.clone(),
        )?;
        let cmd_id = self
            .inner
            .nucleus
            .stream_add(&command_key(callee), &command.to_fields(), STREAM_LEN)
            .await?;

        let inbox = response_key(&self.inner.name);

        // Phase one: the acknowledgement, carrying the response deadline.
        let deadline = Instant::now() + options.ack_timeout;
        let mut response_timeout_ms = None;
        'ack: while response_timeout_ms.is_none() {
            let Some(budget) = remaining_ms(deadline) else {
                break;
            };
            let chunks = self
                .inner
                .nucleus
                .stream_read(&[(inbox.clone(), cursor.to_string())], None, Some(budget))
                .await?;
            for entry in chunks.into_iter().flat_map(|chunk| chunk.entries) {
                cursor = entry.id;
                if let Some(timeout_ms) = ack_timeout_ms(&entry.fields, callee, cmd_id) {
                    response_timeout_ms = Some(timeout_ms);
                    continue 'ack;
                }
                self.update_response_id_if_newer(cursor);
            }
        }
        let Some(response_timeout_ms) = response_timeout_ms else {
            let err_str = format!("Did not receive acknowledge from {callee}.");
            self.log(LogLevel::Err, &err_str).await.ok();
            return Ok(Response::error(codes::COMMAND_NO_ACK, err_str));
        };

        // Phase two: the response, within the acknowledged budget.
        let deadline = Instant::now() + Duration::from_millis(response_timeout_ms);
        loop {
            let Some(budget) = remaining_ms(deadline) else {
                break;
            };
            let chunks = self
                .inner
                .nucleus
                .stream_read(&[(inbox.clone(), cursor.to_string())], None, Some(budget))
                .await?;

            let mut matched = None;
            for entry in chunks.into_iter().flat_map(|chunk| chunk.entries) {
                cursor = entry.id;
                if matched.is_none() {
                    matched =
                        match_response(&entry.fields, callee, cmd_id, options.deserialization);
                }
            }
            self.update_response_id_if_newer(cursor);

            if let Some(response) = matched {
                if !response.is_ok() && !response.err_str.is_empty() {
                    self.log(LogLevel::Err, &response.err_str).await.ok();
                }
                return Ok(response);
            }
        }

        let err_str = format!("Did not receive response from {callee}.");
        self.log(LogLevel::Err, &err_str).await.ok();
        Ok(Response::error(codes::COMMAND_NO_RESPONSE, err_str))
    }
}

fn remaining_ms(deadline: Instant) -> Option<u64> {
    let now = Instant::now();
    if now >= deadline {
        return None;
    }
    Some(((deadline - now).as_millis() as u64).max(1))
}

fn field_str<'f>(fields: &'f HashMap<String, Vec<u8>>, key: &str) -> Option<&'f str> {
    fields.get(key).and_then(|value| std::str::from_utf8(value).ok())
}

/// An inbox entry acknowledges `(callee, cmd_id)` when it names them both
/// and carries a timeout.
fn ack_timeout_ms(
    fields: &HashMap<String, Vec<u8>>,
    callee: &str,
    cmd_id: EntryId,
) -> Option<u64> {
    if field_str(fields, "element")? != callee {
        return None;
    }
    if field_str(fields, "cmd_id")? != cmd_id.to_string() {
        return None;
    }
    field_str(fields, "timeout")?.parse().ok()
}

/// Like the acknowledgement match, but an `err_code` is additionally
/// required; its presence is what distinguishes a response.
fn match_response(
    fields: &HashMap<String, Vec<u8>>,
    callee: &str,
    cmd_id: EntryId,
    deserialization: Serialization,
) -> Option<Response> {
    if field_str(fields, "element")? != callee {
        return None;
    }
    if field_str(fields, "cmd_id")? != cmd_id.to_string() {
        return None;
    }
    let err_code: u64 = field_str(fields, "err_code")?.parse().ok()?;
    let err_str = field_str(fields, "err_str").unwrap_or("").to_string();

    let raw = fields.get("data").cloned().unwrap_or_default();
    let data = if deserialization != Serialization::None && !raw.is_empty() {
        match deserialization.decode_value(&raw) {
            Ok(value) => Datum::Value(value),
            Err(error) => {
                tracing::warn!(%error, "could not deserialize response data, returning raw bytes");
                Datum::Bytes(raw.into())
            }
        }
    } else {
        Datum::Bytes(raw.into())
    };

    let mut extras = BTreeMap::new();
    for (key, value) in fields {
        if !crate::messages::is_reserved(key) {
            extras.insert(key.clone(), Bytes::from(value.clone()));
        }
    }

    Some(Response {
        data,
        err_code,
        err_str,
        extras,
    })
}
