//! Ocean Optics / Ocean Insight spectrometer driver.
//!
//! Speaks the Ocean Binary Protocol (OBP): fixed 44-byte little-endian
//! headers carrying a message type, up to 16 bytes of immediate data, and an
//! optional payload block followed by a checksum and footer. The device
//! operates strictly request/response, which the transport abstraction
//! reflects with a single `transact` call.
//!
//! The wavelength axis is reconstructed at connect time from the device's
//! calibration polynomial, the same way the vendor library derives it:
//! `wl(p) = c0 + c1*p + c2*p^2 + c3*p^3` over pixel index `p`.
//!
//! The mock transport emulates enough of the instrument for driver tests;
//! the real serial transport is compiled behind the `instrument_serial`
//! feature.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{FrogError, FrogResult};
use crate::hardware::capabilities::Spectrometer;
use crate::hardware::Spectrum;

// OBP message types
const OBP_GET_CORRECTED_SPECTRUM: u32 = 0x0010_1100;
const OBP_GET_INTEGRATION_TIME: u32 = 0x0011_0000;
const OBP_SET_INTEGRATION_TIME: u32 = 0x0011_0010;
const OBP_SET_SCANS_TO_AVERAGE: u32 = 0x0012_0010;
const OBP_GET_WAVELENGTH_COEFFS: u32 = 0x0018_0100;

const OBP_HEADER_LEN: usize = 44;
/// Checksum block plus footer, always trailing the payload.
const OBP_TRAILER_LEN: usize = 20;

const OBP_START: [u8; 2] = [0xC1, 0xC0];
const OBP_FOOTER: [u8; 4] = [0xC5, 0xC4, 0xC3, 0xC2];
const OBP_PROTOCOL_VERSION: u16 = 0x1100;

/// Integration-time range of the lab's USB2000+ class bench, microseconds.
pub const DEFAULT_INTEGRATION_LIMITS_US: (u64, u64) = (1_000, 10_000_000);

// =============================================================================
// Framing
// =============================================================================

fn build_message(msg_type: u32, immediate: &[u8]) -> Bytes {
    debug_assert!(immediate.len() <= 16);

    let mut frame = BytesMut::with_capacity(OBP_HEADER_LEN + OBP_TRAILER_LEN);
    frame.put_slice(&OBP_START);
    frame.put_u16_le(OBP_PROTOCOL_VERSION);
    frame.put_u16_le(0); // flags: no response to acks requested
    frame.put_u16_le(0); // error number
    frame.put_u32_le(msg_type);
    frame.put_u32_le(0); // regarding
    frame.put_slice(&[0u8; 6]); // reserved
    frame.put_u8(0); // checksum type: none
    frame.put_u8(immediate.len() as u8);
    let mut padded = [0u8; 16];
    padded[..immediate.len()].copy_from_slice(immediate);
    frame.put_slice(&padded);
    frame.put_u32_le(OBP_TRAILER_LEN as u32); // bytes remaining, no payload
    frame.put_slice(&[0u8; 16]); // checksum
    frame.put_slice(&OBP_FOOTER);
    frame.freeze()
}

struct ObpResponse {
    msg_type: u32,
    error_no: u16,
    data: Vec<u8>,
}

fn parse_response(frame: &[u8]) -> FrogResult<ObpResponse> {
    if frame.len() < OBP_HEADER_LEN + OBP_TRAILER_LEN || frame[..2] != OBP_START {
        return Err(FrogError::DeviceComms("malformed OBP frame".into()));
    }

    let error_no = u16::from_le_bytes([frame[4], frame[5]]);
    let msg_type = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]);
    let immediate_len = frame[23] as usize;
    let bytes_remaining =
        u32::from_le_bytes([frame[40], frame[41], frame[42], frame[43]]) as usize;

    let payload_len = bytes_remaining.saturating_sub(OBP_TRAILER_LEN);
    let payload_end = OBP_HEADER_LEN + payload_len;
    if frame.len() < payload_end + OBP_TRAILER_LEN {
        return Err(FrogError::DeviceComms("truncated OBP frame".into()));
    }

    let data = if payload_len > 0 {
        frame[OBP_HEADER_LEN..payload_end].to_vec()
    } else {
        frame[24..24 + immediate_len.min(16)].to_vec()
    };

    Ok(ObpResponse {
        msg_type,
        error_no,
        data,
    })
}

fn build_response(msg_type: u32, immediate: &[u8], payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(OBP_HEADER_LEN + payload.len() + OBP_TRAILER_LEN);
    frame.put_slice(&OBP_START);
    frame.put_u16_le(OBP_PROTOCOL_VERSION);
    frame.put_u16_le(0);
    frame.put_u16_le(0);
    frame.put_u32_le(msg_type);
    frame.put_u32_le(0);
    frame.put_slice(&[0u8; 6]);
    frame.put_u8(0);
    frame.put_u8(immediate.len() as u8);
    let mut padded = [0u8; 16];
    padded[..immediate.len()].copy_from_slice(immediate);
    frame.put_slice(&padded);
    frame.put_u32_le((payload.len() + OBP_TRAILER_LEN) as u32);
    frame.put_slice(payload);
    frame.put_slice(&[0u8; 16]);
    frame.put_slice(&OBP_FOOTER);
    frame.freeze()
}

// =============================================================================
// Transport abstraction (for testing)
// =============================================================================

#[async_trait]
trait ObpTransport: Send + Sync {
    async fn transact(&mut self, request: Bytes) -> FrogResult<Bytes>;
}

/// Emulated instrument answering from internal registers with a sech-shaped
/// line centered on the detector.
struct MockObpTransport {
    pixels: usize,
    integration_time_us: u32,
    scans_to_average: u16,
}

impl MockObpTransport {
    fn new(pixels: usize) -> Self {
        Self {
            pixels,
            integration_time_us: 30_000,
            scans_to_average: 1,
        }
    }

    fn spectrum_payload(&self) -> Vec<u8> {
        let center = self.pixels as f64 / 2.0;
        let width = self.pixels as f64 / 12.0;
        let mut payload = Vec::with_capacity(self.pixels * 2);
        for p in 0..self.pixels {
            let value = 16_000.0 / ((p as f64 - center) / width).cosh();
            payload.extend_from_slice(&(value as u16).to_le_bytes());
        }
        payload
    }
}

#[async_trait]
impl ObpTransport for MockObpTransport {
    async fn transact(&mut self, request: Bytes) -> FrogResult<Bytes> {
        let parsed = parse_response(&request)?;
        let reply = match parsed.msg_type {
            OBP_GET_CORRECTED_SPECTRUM => {
                build_response(parsed.msg_type, &[], &self.spectrum_payload())
            }
            OBP_GET_INTEGRATION_TIME => {
                build_response(parsed.msg_type, &self.integration_time_us.to_le_bytes(), &[])
            }
            OBP_SET_INTEGRATION_TIME => {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&parsed.data[..4]);
                self.integration_time_us = u32::from_le_bytes(bytes);
                build_response(parsed.msg_type, &[], &[])
            }
            OBP_SET_SCANS_TO_AVERAGE => {
                let mut bytes = [0u8; 2];
                bytes.copy_from_slice(&parsed.data[..2]);
                self.scans_to_average = u16::from_le_bytes(bytes);
                build_response(parsed.msg_type, &[], &[])
            }
            OBP_GET_WAVELENGTH_COEFFS => {
                // Linear axis 350-1150 nm across the detector.
                let c0 = 350.0f32;
                let c1 = 800.0f32 / (self.pixels as f32 - 1.0);
                let mut payload = Vec::with_capacity(16);
                for coeff in [c0, c1, 0.0f32, 0.0f32] {
                    payload.extend_from_slice(&coeff.to_le_bytes());
                }
                build_response(parsed.msg_type, &[], &payload)
            }
            other => {
                return Err(FrogError::DeviceComms(format!(
                    "mock transport: unsupported message {other:#010x}"
                )))
            }
        };
        Ok(reply)
    }
}

/// Blocking serial I/O wrapped in a mutex, one transaction at a time.
#[cfg(feature = "instrument_serial")]
struct RealObpTransport {
    port: std::sync::Mutex<Box<dyn serialport::SerialPort>>,
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl ObpTransport for RealObpTransport {
    async fn transact(&mut self, request: Bytes) -> FrogResult<Bytes> {
        use std::io::{Read, Write};
        let mut port = self
            .port
            .lock()
            .map_err(|_| FrogError::DeviceComms("serial port lock poisoned".into()))?;

        port.write_all(&request)
            .map_err(|err| FrogError::DeviceComms(format!("OBP write failed: {err}")))?;

        let mut header = [0u8; OBP_HEADER_LEN];
        port.read_exact(&mut header)
            .map_err(|err| FrogError::DeviceComms(format!("OBP header read failed: {err}")))?;

        let bytes_remaining =
            u32::from_le_bytes([header[40], header[41], header[42], header[43]]) as usize;
        let mut rest = vec![0u8; bytes_remaining];
        port.read_exact(&mut rest)
            .map_err(|err| FrogError::DeviceComms(format!("OBP body read failed: {err}")))?;

        let mut frame = header.to_vec();
        frame.extend_from_slice(&rest);
        Ok(Bytes::from(frame))
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Wire mode for the Ocean Optics driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OceanSdkKind {
    /// Emulated instrument for testing.
    Mock,
    /// Real instrument over its serial port.
    Real,
}

/// OBP-speaking fiber spectrometer.
pub struct OceanOpticsSpectrometer {
    link: Mutex<Box<dyn ObpTransport>>,
    wavelengths: Arc<[f64]>,
    integration_time_us: RwLock<u64>,
    integration_limits_us: (u64, u64),
    scans_to_avg: RwLock<u32>,
}

impl OceanOpticsSpectrometer {
    /// Connect to an instrument and read its wavelength calibration.
    ///
    /// # Arguments
    /// * `port_path` - serial port of the instrument (ignored in mock mode)
    /// * `sdk_kind` - mock or real transport
    /// * `integration_limits_us` - supported integration-time range from the
    ///   device datasheet, e.g. [`DEFAULT_INTEGRATION_LIMITS_US`]
    pub async fn open(
        port_path: &str,
        sdk_kind: OceanSdkKind,
        integration_limits_us: (u64, u64),
    ) -> FrogResult<Self> {
        let link: Box<dyn ObpTransport> = match sdk_kind {
            OceanSdkKind::Mock => Box::new(MockObpTransport::new(2048)),
            #[cfg(feature = "instrument_serial")]
            OceanSdkKind::Real => {
                let port = serialport::new(port_path, 115_200)
                    .timeout(std::time::Duration::from_millis(500))
                    .open()
                    .map_err(|err| {
                        FrogError::DeviceComms(format!("failed to open {port_path}: {err}"))
                    })?;
                Box::new(RealObpTransport {
                    port: std::sync::Mutex::new(port),
                })
            }
            #[cfg(not(feature = "instrument_serial"))]
            OceanSdkKind::Real => return Err(FrogError::SerialFeatureDisabled),
        };

        let mut spectrometer = Self {
            link: Mutex::new(link),
            wavelengths: Arc::from(Vec::new()),
            integration_time_us: RwLock::new(0),
            integration_limits_us,
            scans_to_avg: RwLock::new(1),
        };

        // Pixel count comes from a first spectrum read; the axis from the
        // device's calibration polynomial over those pixels.
        let coeffs = spectrometer.wavelength_coeffs().await?;
        let pixels = spectrometer.read_raw_intensities().await?.len();
        spectrometer.wavelengths = (0..pixels)
            .map(|p| {
                let p = p as f64;
                coeffs[0] + coeffs[1] * p + coeffs[2] * p * p + coeffs[3] * p * p * p
            })
            .collect::<Vec<_>>()
            .into();

        let itime = spectrometer.read_integration_time().await?;
        *spectrometer.integration_time_us.write().await = itime;

        debug!(port_path, ?sdk_kind, pixels, "ocean optics spectrometer opened");
        Ok(spectrometer)
    }

    async fn transact(&self, msg_type: u32, immediate: &[u8]) -> FrogResult<ObpResponse> {
        let request = build_message(msg_type, immediate);
        let reply = self.link.lock().await.transact(request).await?;
        let parsed = parse_response(&reply)?;
        if parsed.error_no != 0 {
            return Err(FrogError::DeviceComms(format!(
                "device error {} for message {msg_type:#010x}",
                parsed.error_no
            )));
        }
        Ok(parsed)
    }

    async fn wavelength_coeffs(&self) -> FrogResult<[f64; 4]> {
        let response = self.transact(OBP_GET_WAVELENGTH_COEFFS, &[]).await?;
        if response.data.len() < 16 {
            return Err(FrogError::DeviceComms(
                "short wavelength coefficient block".into(),
            ));
        }
        let mut coeffs = [0.0f64; 4];
        for (i, chunk) in response.data.chunks_exact(4).take(4).enumerate() {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(chunk);
            coeffs[i] = f32::from_le_bytes(bytes) as f64;
        }
        Ok(coeffs)
    }

    async fn read_integration_time(&self) -> FrogResult<u64> {
        let response = self.transact(OBP_GET_INTEGRATION_TIME, &[]).await?;
        if response.data.len() < 4 {
            return Err(FrogError::DeviceComms("short integration time reply".into()));
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&response.data[..4]);
        Ok(u32::from_le_bytes(bytes) as u64)
    }

    async fn read_raw_intensities(&self) -> FrogResult<Vec<f64>> {
        let response = self.transact(OBP_GET_CORRECTED_SPECTRUM, &[]).await?;
        Ok(response
            .data
            .chunks_exact(2)
            .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]) as f64)
            .collect())
    }
}

#[async_trait]
impl Spectrometer for OceanOpticsSpectrometer {
    async fn wavelengths(&self) -> FrogResult<Arc<[f64]>> {
        Ok(Arc::clone(&self.wavelengths))
    }

    async fn intensities(&self) -> FrogResult<Vec<f64>> {
        self.read_raw_intensities().await
    }

    async fn spectrum(&self) -> FrogResult<Spectrum> {
        let intensities = self.read_raw_intensities().await?;
        Ok(Spectrum::new(Arc::clone(&self.wavelengths), intensities))
    }

    async fn integration_time_micros(&self) -> u64 {
        *self.integration_time_us.read().await
    }

    async fn set_integration_time_micros(&self, micros: u64) -> FrogResult<()> {
        let (min_us, max_us) = self.integration_limits_us;
        if micros < min_us || micros > max_us {
            return Err(FrogError::IntegrationTime {
                requested_us: micros,
                min_us,
                max_us,
            });
        }
        self.transact(OBP_SET_INTEGRATION_TIME, &(micros as u32).to_le_bytes())
            .await?;
        *self.integration_time_us.write().await = micros;
        Ok(())
    }

    fn integration_time_micros_limit(&self) -> (u64, u64) {
        self.integration_limits_us
    }

    async fn scans_to_avg(&self) -> u32 {
        *self.scans_to_avg.read().await
    }

    async fn set_scans_to_avg(&self, n: u32) -> FrogResult<()> {
        if n < 1 {
            return Err(FrogError::AverageCount(n));
        }
        self.transact(OBP_SET_SCANS_TO_AVERAGE, &(n as u16).to_le_bytes())
            .await?;
        *self.scans_to_avg.write().await = n;
        Ok(())
    }

    async fn close(&self) -> FrogResult<()> {
        Ok(())
    }
}
