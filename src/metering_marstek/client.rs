use log::{debug, warn};
use std::sync::Arc;

use super::codec;
use super::structs::{ConnectionConfig, DeviceIdentity, TelemetryRecord};
use super::transport::Transport;
use super::MarstekError;

/// Issues logical requests against one meter.
///
/// Keeps the last encoded frame together with the identity it was built from, so repeated
/// polls of the same meter do not re-encode.
pub struct MarstekClient {
    transport: Arc<dyn Transport>,
    cached: Option<(DeviceIdentity, Vec<u8>)>,
    log_prefix: String,
}

impl MarstekClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        MarstekClient {
            transport,
            cached: None,
            log_prefix: String::new(),
        }
    }

    pub fn with_log_prefix(mut self, prefix: String) -> Self {
        self.log_prefix = prefix;
        self
    }

    pub fn set_log_prefix(&mut self, prefix: String) {
        self.log_prefix = prefix;
    }

    /// Cached frame for `identity`, encoding it first if the cache holds another identity
    pub fn frame_for(&mut self, identity: &DeviceIdentity) -> &[u8] {
        let stale = match &self.cached {
            Some((cached_id, _)) => cached_id != identity,
            None => true,
        };

        if stale {
            let frame = codec::build_request(identity);
            if frame.len() >= 100 {
                warn!("{} Request frame is {} bytes long, replies of that size do not fit a two digit length field",
                      self.log_prefix, frame.len());
            }
            self.cached = Some((identity.clone(), frame));
        }

        match &self.cached {
            Some((_, frame)) => frame,
            None => &[],
        }
    }

    pub fn cached_frame(&self) -> Option<&[u8]> {
        self.cached.as_ref().map(|(_, frame)| frame.as_slice())
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// Encode (or reuse) the frame for `identity` and run it through `request_frame`
    pub async fn request(&mut self, config: &ConnectionConfig, identity: &DeviceIdentity) -> Result<TelemetryRecord, MarstekError> {
        let frame = self.frame_for(identity).to_vec();
        self.request_frame(config, &frame).await
    }

    /// Send `frame` up to `retries + 1` times, one attempt after the other.
    ///
    /// Returns the first decoded reply, or the error of the last attempt.
    pub async fn request_frame(&self, config: &ConnectionConfig, frame: &[u8]) -> Result<TelemetryRecord, MarstekError> {
        let attempts = config.retries + 1;
        let mut last_error = MarstekError::Timeout(config.timeout_ms);

        for attempt in 1..=attempts {
            match self.attempt(config, frame).await {
                Ok(record) => return Ok(record),
                Err(e) => {
                    debug!("{} Attempt {attempt}/{attempts} failed: {e}", self.log_prefix);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn attempt(&self, config: &ConnectionConfig, frame: &[u8]) -> Result<TelemetryRecord, MarstekError> {
        if config.debug {
            debug!("{} UDP payload (hex): {}", self.log_prefix, hex::encode(frame));
        }

        let raw = self
            .transport
            .send(frame, &config.host, config.port, config.timeout())
            .await?;

        if config.debug {
            debug!("{} UDP response (hex): {}", self.log_prefix, hex::encode(&raw));
            if !codec::verify_checksum(&raw) {
                warn!("{} Response checksum does not match, using it anyway", self.log_prefix);
            }
        }

        let record = codec::parse_response(&raw)?;

        if config.debug {
            debug!("{} Parsed response: {}", self.log_prefix,
                   serde_json::to_string(&record).unwrap_or_default());
        }

        Ok(record)
    }
}
