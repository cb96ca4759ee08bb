//! Shared test utilities for `geckota` integration tests.
//!
//! Provides a wiremock-backed firmware index server and a scripted
//! in-process peripheral implementing [`BleTransport`].

// Allow dead code since not all test files use all helpers
#![allow(dead_code)]

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use geckota::ble::{BleError, BleTransport};
use geckota::protocol::{
    BOOTLOADER_VERSION_UUID, CTL_CLOSE, CTL_DONE, CTL_START, OTA_CONTROL_UUID, OTA_DATA_UUID,
};

/// Hex MD5 digest as the index advertises it.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Wiremock server hosting an `index.json` and artifact bodies.
pub struct MockIndexServer {
    server: MockServer,
}

impl MockIndexServer {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn base_url(&self) -> String {
        self.server.uri()
    }

    /// URL an index entry should advertise for a mounted artifact.
    pub fn artifact_url(&self, name: &str) -> String {
        format!("{}/artifacts/{name}", self.server.uri())
    }

    pub async fn mount_index(&self, client: &str, channel: &str, index: Value) {
        Mock::given(method("GET"))
            .and(path(format!("/{client}/{channel}/index.json")))
            .respond_with(ResponseTemplate::new(200).set_body_json(index))
            .mount(&self.server)
            .await;
    }

    /// Mount an index endpoint with an arbitrary body and status.
    pub async fn mount_index_raw(&self, client: &str, channel: &str, status: u16, body: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/{client}/{channel}/index.json")))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(&self.server)
            .await;
    }

    pub async fn mount_artifact(&self, name: &str, body: &[u8]) {
        Mock::given(method("GET"))
            .and(path(format!("/artifacts/{name}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "application/octet-stream")
                    .set_body_bytes(body.to_vec()),
            )
            .mount(&self.server)
            .await;
    }
}

/// Every GATT interaction the engine performs, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GattOp {
    Cancel,
    Connect(u16),
    Discover,
    RequestMtu(u16),
    Read(Uuid),
    WriteWithResponse(Uuid, Vec<u8>),
    WriteWithoutResponse(Uuid, Vec<u8>),
}

struct PeripheralState {
    ops: Vec<GattOp>,
    mtu: u16,
    connected: bool,
    in_dfu: bool,
    armed: bool,
    reboot_requested: bool,
    connect_attempts: usize,
    failing_connect_attempts: HashSet<usize>,
    remaining_data_write_failures: usize,
    remaining_control_write_failures: usize,
    buffer: Vec<u8>,
    data_write_sizes: Vec<usize>,
    completed_images: Vec<Vec<u8>>,
}

/// Scripted Gecko OTA peripheral.
///
/// Starts in application mode unless built with [`MockPeripheral::in_dfu`].
/// A `CTL_START` written in application mode requests the reboot; the
/// bootloader comes up once the link drops. A `CTL_START` written in DFU
/// mode arms the upload and resets the receive buffer. `CTL_DONE` files
/// the buffered bytes as a completed image. Data writes outside an armed
/// upload are rejected, which turns ordering violations into test
/// failures.
pub struct MockPeripheral {
    state: Mutex<PeripheralState>,
}

impl MockPeripheral {
    /// Peripheral running application firmware.
    pub fn new(mtu: u16) -> Self {
        Self {
            state: Mutex::new(PeripheralState {
                ops: Vec::new(),
                mtu,
                connected: false,
                in_dfu: false,
                armed: false,
                reboot_requested: false,
                connect_attempts: 0,
                failing_connect_attempts: HashSet::new(),
                remaining_data_write_failures: 0,
                remaining_control_write_failures: 0,
                buffer: Vec::new(),
                data_write_sizes: Vec::new(),
                completed_images: Vec::new(),
            }),
        }
    }

    /// Peripheral already running the bootloader.
    pub fn in_dfu(mtu: u16) -> Self {
        let peripheral = Self::new(mtu);
        peripheral.state.lock().unwrap().in_dfu = true;
        peripheral
    }

    /// Refuse the given connect attempts (1-based, counted over the whole
    /// session).
    pub fn fail_connect_attempts(&self, attempts: &[usize]) {
        let mut state = self.state.lock().unwrap();
        state.failing_connect_attempts = attempts.iter().copied().collect();
    }

    /// Refuse the next `count` data writes with a transport error.
    pub fn fail_next_data_writes(&self, count: usize) {
        self.state.lock().unwrap().remaining_data_write_failures = count;
    }

    /// Refuse the next `count` control writes with a transport error.
    pub fn fail_next_control_writes(&self, count: usize) {
        self.state.lock().unwrap().remaining_control_write_failures = count;
    }

    pub fn ops(&self) -> Vec<GattOp> {
        self.state.lock().unwrap().ops.clone()
    }

    /// Sizes of every accepted data write, in order.
    pub fn data_write_sizes(&self) -> Vec<usize> {
        self.state.lock().unwrap().data_write_sizes.clone()
    }

    /// Images completed with a `CTL_DONE`, in completion order.
    pub fn completed_images(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().completed_images.clone()
    }

    /// Control words written to OTA Control, in order, regardless of
    /// write mode.
    pub fn control_writes(&self) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter_map(|op| match op {
                GattOp::WriteWithResponse(c, v) | GattOp::WriteWithoutResponse(c, v)
                    if *c == OTA_CONTROL_UUID =>
                {
                    v.first().copied()
                }
                _ => None,
            })
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connect_attempts
    }
}

#[async_trait]
impl BleTransport for MockPeripheral {
    async fn connect(&self, mtu_hint: u16) -> Result<(), BleError> {
        let mut state = self.state.lock().unwrap();
        state.connect_attempts += 1;
        state.ops.push(GattOp::Connect(mtu_hint));
        if state.failing_connect_attempts.contains(&state.connect_attempts) {
            return Err(BleError::Transport("connect refused".to_string()));
        }
        state.connected = true;
        Ok(())
    }

    async fn discover_services(&self) -> Result<(), BleError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(GattOp::Discover);
        if !state.connected {
            return Err(BleError::NotConnected);
        }
        Ok(())
    }

    async fn request_mtu(&self, mtu: u16) -> Result<u16, BleError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(GattOp::RequestMtu(mtu));
        if !state.connected {
            return Err(BleError::NotConnected);
        }
        Ok(state.mtu)
    }

    async fn read_characteristic(
        &self,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, BleError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(GattOp::Read(characteristic));
        if !state.connected {
            return Err(BleError::NotConnected);
        }
        if characteristic == BOOTLOADER_VERSION_UUID {
            // Only the bootloader's GATT database exposes this.
            if state.in_dfu {
                return Ok(vec![0x02, 0x03]);
            }
            return Err(BleError::CharacteristicNotFound(characteristic));
        }
        Err(BleError::CharacteristicNotFound(characteristic))
    }

    async fn write_with_response(
        &self,
        _service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        let mut state = self.state.lock().unwrap();
        state
            .ops
            .push(GattOp::WriteWithResponse(characteristic, value.to_vec()));
        if !state.connected {
            return Err(BleError::NotConnected);
        }
        if characteristic == OTA_CONTROL_UUID {
            if state.remaining_control_write_failures > 0 {
                state.remaining_control_write_failures -= 1;
                return Err(BleError::Transport("control write rejected".to_string()));
            }
            match value.first().copied() {
                Some(CTL_START) => {
                    if state.in_dfu {
                        state.armed = true;
                        state.buffer.clear();
                    } else {
                        state.reboot_requested = true;
                    }
                }
                Some(CTL_DONE) => {
                    if state.in_dfu && state.armed {
                        let image = std::mem::take(&mut state.buffer);
                        state.completed_images.push(image);
                        state.armed = false;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn write_without_response(
        &self,
        _service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        let mut state = self.state.lock().unwrap();
        state
            .ops
            .push(GattOp::WriteWithoutResponse(characteristic, value.to_vec()));
        if !state.connected {
            return Err(BleError::NotConnected);
        }
        if characteristic == OTA_DATA_UUID {
            if state.remaining_data_write_failures > 0 {
                state.remaining_data_write_failures -= 1;
                return Err(BleError::Transport("radio interference".to_string()));
            }
            if !state.armed {
                return Err(BleError::Transport(
                    "data write before upload was armed".to_string(),
                ));
            }
            state.buffer.extend_from_slice(value);
            state.data_write_sizes.push(value.len());
        } else if characteristic == OTA_CONTROL_UUID && value.first() == Some(&CTL_CLOSE) {
            // The target drops the link on a close request.
            state.connected = false;
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    async fn cancel_connection(&self) -> Result<(), BleError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(GattOp::Cancel);
        state.connected = false;
        // Losing the link is what lets a requested reboot happen.
        if state.reboot_requested {
            state.reboot_requested = false;
            state.in_dfu = true;
            state.armed = false;
        }
        Ok(())
    }
}

/// Initialize tracing for tests (only once).
///
/// Defaults to `warn` level to reduce noise. Use `RUST_LOG=debug` for
/// verbose output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
        .with_test_writer()
        .try_init();
}
