//! Downstream relay to device channels
//!
//! Turns a platform request into a device-protocol command on the session's
//! channel and ties the device acknowledgment back to it. The session key and
//! a fresh flow number form the correlation key; whoever relayed the command
//! supplies a completion that answers the platform request.

use std::sync::Arc;
use std::time::Duration;

use crate::codec::{Codec, Message};
use crate::correlator::{FlowKey, RequestCorrelator};
use crate::session::{Session, SessionRegistry};
use crate::{Error, Result};

/// Relays correlated commands to devices
#[derive(Debug)]
pub struct DeviceRelay {
    codec: Codec,
    acks: RequestCorrelator<FlowKey, i32>,
}

impl DeviceRelay {
    /// Relay whose acknowledgments expire after `ack_timeout`
    #[must_use]
    pub fn new(codec: Codec, ack_timeout: Duration) -> Self {
        Self {
            codec,
            acks: RequestCorrelator::new(ack_timeout),
        }
    }

    /// Codec used for device lines
    #[must_use]
    pub const fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Send a report-period command and wait for the device in the background
    ///
    /// `on_ack` runs exactly once with the device result code, or with the
    /// correlation error if the device never answered. Returns the flow
    /// number assigned to the command.
    ///
    /// # Errors
    ///
    /// Returns error if the flow number is already in flight or the channel
    /// is gone; `on_ack` is not called in that case
    pub fn send_frequency<F>(&self, session: &Arc<Session>, period: u32, on_ack: F) -> Result<String>
    where
        F: FnOnce(Result<i32>) + Send + 'static,
    {
        let flow_no = SessionRegistry::next_sequence(session).to_string();
        let handle = self
            .acks
            .register((session.key().to_string(), flow_no.clone()))?;

        let line = self
            .codec
            .encode(&Message::frequency_set(session.key(), &flow_no, period));
        session.channel().write(line)?;
        tracing::debug!(
            key = %session.key(),
            flow_no = %flow_no,
            period,
            "relayed report period to device"
        );

        let timeout = self.acks.default_timeout();
        tokio::spawn(async move {
            on_ack(handle.wait(timeout).await.map_err(Error::from));
        });

        Ok(flow_no)
    }

    /// Match a device acknowledgment to the command it answers
    ///
    /// Returns false for late, duplicate or unsolicited acknowledgments.
    pub fn on_device_ack(&self, session_key: &str, flow_no: &str, result_code: i32) -> bool {
        self.acks
            .complete(&(session_key.to_string(), flow_no.to_string()), result_code)
    }

    /// Commands still waiting for a device acknowledgment
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.acks.len()
    }
}
