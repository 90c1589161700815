//! Thorlabs Kinesis-family linear stage driver.
//!
//! Speaks the APT message protocol used by KDC101-class controllers over
//! their USB virtual serial port: little-endian framed messages with a 6-byte
//! header, extended by a data packet when bit 7 of the destination byte is
//! set. Motion commands are fire-and-forget; completion is observed by
//! polling the status word, which is how the motion monitor expects a stage
//! to behave.
//!
//! ## Protocol
//!
//! - Link: 115200 baud, 8N1 over the controller's VCP
//! - Host address `0x01`, generic USB device address `0x50`
//! - Positions travel as encoder counts; the count-per-mm scale is a property
//!   of the attached actuator (34,304 counts/mm for the Z8-series leadscrews)
//!
//! ## Testing
//!
//! The wire link is abstracted behind a private trait with a mock
//! implementation, so the driver's framing and scaling are exercised without
//! hardware. The real link is compiled behind the `instrument_serial`
//! feature.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::error::{FrogError, FrogResult};
use crate::hardware::capabilities::LinearMotor;

// APT message IDs
const MGMSG_MOT_MOVE_HOME: u16 = 0x0443;
const MGMSG_MOT_MOVE_RELATIVE: u16 = 0x0448;
const MGMSG_MOT_MOVE_ABSOLUTE: u16 = 0x0453;
const MGMSG_MOT_MOVE_STOP: u16 = 0x0465;
const MGMSG_MOT_REQ_STATUSUPDATE: u16 = 0x0480;
const MGMSG_MOT_GET_STATUSUPDATE: u16 = 0x0481;

// Status word bits
const STATUS_MOVING_CW: u32 = 0x0000_0010;
const STATUS_MOVING_CCW: u32 = 0x0000_0020;
const STATUS_HOMING: u32 = 0x0000_0200;
const STATUS_HOMED: u32 = 0x0000_0400;

const HOST_ADDR: u8 = 0x01;
const DEVICE_ADDR: u8 = 0x50;

/// Profiled (decelerating) stop, as opposed to an immediate halt.
const STOP_MODE_PROFILED: u8 = 0x02;

/// Encoder counts per millimeter for the Z8-series actuators shipped with
/// the lab's delay stage.
pub const Z8_COUNTS_PER_MM: f64 = 34_304.0;

/// Frames the link may drain while waiting for a specific reply
/// (unsolicited move-completed / homed notifications).
const MAX_SKIPPED_FRAMES: usize = 8;

// =============================================================================
// Wire link abstraction (for testing)
// =============================================================================

#[async_trait]
trait AptLink: Send + Sync {
    async fn write_frame(&mut self, frame: Bytes) -> FrogResult<()>;
    async fn read_frame(&mut self) -> FrogResult<Bytes>;
}

fn short_frame(msg_id: u16, param1: u8, param2: u8) -> Bytes {
    let mut frame = BytesMut::with_capacity(6);
    frame.put_u16_le(msg_id);
    frame.put_u8(param1);
    frame.put_u8(param2);
    frame.put_u8(DEVICE_ADDR);
    frame.put_u8(HOST_ADDR);
    frame.freeze()
}

fn long_frame(msg_id: u16, data: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(6 + data.len());
    frame.put_u16_le(msg_id);
    frame.put_u16_le(data.len() as u16);
    frame.put_u8(DEVICE_ADDR | 0x80);
    frame.put_u8(HOST_ADDR);
    frame.put_slice(data);
    frame.freeze()
}

fn frame_msg_id(frame: &[u8]) -> Option<u16> {
    if frame.len() < 6 {
        return None;
    }
    Some(u16::from_le_bytes([frame[0], frame[1]]))
}

// =============================================================================
// Mock link
// =============================================================================

/// Simulated KDC101 answering status requests from an internal position
/// register. Moves land instantly, but the status word reports motion for a
/// few polls afterward so poll loops see a moving stage.
struct MockAptLink {
    position_counts: i32,
    moving_polls: u32,
    homed: bool,
    pending: VecDeque<Bytes>,
}

impl MockAptLink {
    fn new() -> Self {
        Self {
            position_counts: 0,
            moving_polls: 0,
            homed: false,
            pending: VecDeque::new(),
        }
    }

    fn status_frame(&mut self) -> Bytes {
        let mut status = 0u32;
        if self.moving_polls > 0 {
            self.moving_polls -= 1;
            status |= STATUS_MOVING_CW;
        }
        if self.homed {
            status |= STATUS_HOMED;
        }

        let mut data = BytesMut::with_capacity(14);
        data.put_u16_le(1); // channel
        data.put_i32_le(self.position_counts);
        data.put_i32_le(self.position_counts); // encoder count
        data.put_u32_le(status);

        let mut frame = BytesMut::with_capacity(20);
        frame.put_u16_le(MGMSG_MOT_GET_STATUSUPDATE);
        frame.put_u16_le(14);
        frame.put_u8(HOST_ADDR | 0x80);
        frame.put_u8(DEVICE_ADDR);
        frame.put_slice(&data);
        frame.freeze()
    }
}

#[async_trait]
impl AptLink for MockAptLink {
    async fn write_frame(&mut self, frame: Bytes) -> FrogResult<()> {
        let Some(msg_id) = frame_msg_id(&frame) else {
            return Err(FrogError::DeviceComms("short APT frame".into()));
        };

        match msg_id {
            MGMSG_MOT_MOVE_ABSOLUTE => {
                let mut data = frame.slice(6..);
                let _chan = data.get_u16_le();
                self.position_counts = data.get_i32_le();
                self.moving_polls = 2;
            }
            MGMSG_MOT_MOVE_RELATIVE => {
                let mut data = frame.slice(6..);
                let _chan = data.get_u16_le();
                self.position_counts += data.get_i32_le();
                self.moving_polls = 2;
            }
            MGMSG_MOT_MOVE_HOME => {
                self.position_counts = 0;
                self.homed = true;
                self.moving_polls = 3;
            }
            MGMSG_MOT_MOVE_STOP => {
                self.moving_polls = 0;
            }
            MGMSG_MOT_REQ_STATUSUPDATE => {
                let reply = self.status_frame();
                self.pending.push_back(reply);
            }
            other => {
                trace!(msg_id = other, "mock link ignoring message");
            }
        }
        Ok(())
    }

    async fn read_frame(&mut self) -> FrogResult<Bytes> {
        self.pending
            .pop_front()
            .ok_or_else(|| FrogError::DeviceComms("no pending APT response".into()))
    }
}

// =============================================================================
// Real link
// =============================================================================

/// Blocking serial I/O wrapped in a mutex; acceptable for APT's strict
/// request/response cadence at the poll rates the monitors use.
#[cfg(feature = "instrument_serial")]
struct RealAptLink {
    port: std::sync::Mutex<Box<dyn serialport::SerialPort>>,
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl AptLink for RealAptLink {
    async fn write_frame(&mut self, frame: Bytes) -> FrogResult<()> {
        use std::io::Write;
        let mut port = self
            .port
            .lock()
            .map_err(|_| FrogError::DeviceComms("serial port lock poisoned".into()))?;
        port.write_all(&frame)
            .map_err(|err| FrogError::DeviceComms(format!("APT write failed: {err}")))?;
        Ok(())
    }

    async fn read_frame(&mut self) -> FrogResult<Bytes> {
        use std::io::Read;
        let mut port = self
            .port
            .lock()
            .map_err(|_| FrogError::DeviceComms("serial port lock poisoned".into()))?;

        let mut header = [0u8; 6];
        port.read_exact(&mut header)
            .map_err(|err| FrogError::DeviceComms(format!("APT header read failed: {err}")))?;

        let mut frame = header.to_vec();
        if header[4] & 0x80 != 0 {
            let len = u16::from_le_bytes([header[2], header[3]]) as usize;
            let mut data = vec![0u8; len];
            port.read_exact(&mut data)
                .map_err(|err| FrogError::DeviceComms(format!("APT data read failed: {err}")))?;
            frame.extend_from_slice(&data);
        }
        Ok(Bytes::from(frame))
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Wire mode for the Kinesis driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KinesisSdkKind {
    /// Simulated controller for testing.
    Mock,
    /// Real controller over its serial port.
    Real,
}

/// KDC101-class Kinesis motion controller driving a single linear axis.
pub struct KinesisStage {
    link: Mutex<Box<dyn AptLink>>,
    channel: u16,
    counts_per_mm: f64,
    limits_um: (f64, f64),
    cached_um: RwLock<f64>,
}

impl KinesisStage {
    /// Open a controller.
    ///
    /// # Arguments
    /// * `port_path` - serial port of the controller (ignored in mock mode)
    /// * `sdk_kind` - mock or real wire link
    /// * `limits_um` - soft travel limits, fixed for the driver's lifetime
    /// * `counts_per_mm` - actuator scale, e.g. [`Z8_COUNTS_PER_MM`]
    pub fn open(
        port_path: &str,
        sdk_kind: KinesisSdkKind,
        limits_um: (f64, f64),
        counts_per_mm: f64,
    ) -> FrogResult<Self> {
        if limits_um.0 >= limits_um.1 {
            return Err(FrogError::LimitsNotSet);
        }

        let link: Box<dyn AptLink> = match sdk_kind {
            KinesisSdkKind::Mock => Box::new(MockAptLink::new()),
            #[cfg(feature = "instrument_serial")]
            KinesisSdkKind::Real => {
                let port = serialport::new(port_path, 115_200)
                    .timeout(std::time::Duration::from_millis(250))
                    .open()
                    .map_err(|err| {
                        FrogError::DeviceComms(format!("failed to open {port_path}: {err}"))
                    })?;
                Box::new(RealAptLink {
                    port: std::sync::Mutex::new(port),
                })
            }
            #[cfg(not(feature = "instrument_serial"))]
            KinesisSdkKind::Real => return Err(FrogError::SerialFeatureDisabled),
        };

        debug!(port_path, ?sdk_kind, "kinesis stage opened");
        Ok(Self {
            link: Mutex::new(link),
            channel: 1,
            counts_per_mm,
            limits_um,
            cached_um: RwLock::new(0.0),
        })
    }

    fn um_to_counts(&self, um: f64) -> i32 {
        (um / 1_000.0 * self.counts_per_mm).round() as i32
    }

    fn counts_to_um(&self, counts: i32) -> f64 {
        counts as f64 / self.counts_per_mm * 1_000.0
    }

    fn check_limits(&self, predicted_um: f64) -> FrogResult<()> {
        let (lower, upper) = self.limits_um;
        if predicted_um < lower || predicted_um > upper {
            return Err(FrogError::OutOfBounds {
                predicted_um,
                lower_um: lower,
                upper_um: upper,
            });
        }
        Ok(())
    }

    async fn send(&self, frame: Bytes) -> FrogResult<()> {
        self.link.lock().await.write_frame(frame).await
    }

    /// Write a request and read frames until the expected reply arrives,
    /// draining unsolicited notifications on the way.
    async fn transact(&self, frame: Bytes, expect_id: u16) -> FrogResult<Bytes> {
        let mut link = self.link.lock().await;
        link.write_frame(frame).await?;
        for _ in 0..MAX_SKIPPED_FRAMES {
            let reply = link.read_frame().await?;
            match frame_msg_id(&reply) {
                Some(id) if id == expect_id => return Ok(reply),
                Some(id) => trace!(msg_id = id, "draining unsolicited APT frame"),
                None => return Err(FrogError::DeviceComms("malformed APT frame".into())),
            }
        }
        Err(FrogError::DeviceComms(format!(
            "no reply with id {expect_id:#06x}"
        )))
    }

    /// Query the controller status word, returning `(position_um, status)`.
    async fn status(&self) -> FrogResult<(f64, u32)> {
        let request = short_frame(MGMSG_MOT_REQ_STATUSUPDATE, self.channel as u8, 0);
        let reply = self.transact(request, MGMSG_MOT_GET_STATUSUPDATE).await?;
        if reply.len() < 20 {
            return Err(FrogError::DeviceComms("truncated status frame".into()));
        }
        let mut data = reply.slice(6..);
        let _chan = data.get_u16_le();
        let position_counts = data.get_i32_le();
        let _encoder = data.get_i32_le();
        let status = data.get_u32_le();

        let position_um = self.counts_to_um(position_counts);
        *self.cached_um.write().await = position_um;
        Ok((position_um, status))
    }
}

#[async_trait]
impl LinearMotor for KinesisStage {
    async fn position_um(&self) -> FrogResult<f64> {
        let (position_um, _) = self.status().await?;
        Ok(position_um)
    }

    async fn move_to_um(&self, target_um: f64) -> FrogResult<()> {
        self.check_limits(target_um)?;

        let mut data = BytesMut::with_capacity(6);
        data.put_u16_le(self.channel);
        data.put_i32_le(self.um_to_counts(target_um));
        self.send(long_frame(MGMSG_MOT_MOVE_ABSOLUTE, &data)).await?;

        *self.cached_um.write().await = target_um;
        Ok(())
    }

    async fn move_by_um(&self, delta_um: f64) -> FrogResult<()> {
        let predicted = *self.cached_um.read().await + delta_um;
        self.check_limits(predicted)?;

        let mut data = BytesMut::with_capacity(6);
        data.put_u16_le(self.channel);
        data.put_i32_le(self.um_to_counts(delta_um));
        self.send(long_frame(MGMSG_MOT_MOVE_RELATIVE, &data)).await?;

        *self.cached_um.write().await = predicted;
        Ok(())
    }

    async fn home(&self) -> FrogResult<()> {
        self.send(short_frame(MGMSG_MOT_MOVE_HOME, self.channel as u8, 0))
            .await
    }

    async fn is_in_motion(&self) -> FrogResult<bool> {
        let (_, status) = self.status().await?;
        Ok(status & (STATUS_MOVING_CW | STATUS_MOVING_CCW | STATUS_HOMING) != 0)
    }

    async fn stop(&self) -> FrogResult<()> {
        self.send(short_frame(
            MGMSG_MOT_MOVE_STOP,
            self.channel as u8,
            STOP_MODE_PROFILED,
        ))
        .await
    }

    fn travel_limits_um(&self) -> (f64, f64) {
        self.limits_um
    }

    async fn close(&self) -> FrogResult<()> {
        Ok(())
    }
}
