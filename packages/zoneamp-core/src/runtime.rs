//! Hardware runtime abstraction for the preamp board.
//!
//! The controller is polymorphic over [`Runtime`]: the set of physical
//! mutations it needs (power rails, source routing, per-zone state). Two
//! implementations are provided: [`MockRuntime`] always succeeds and records
//! the last argument per call, and [`PreampRuntime`] drives the real board's
//! register file over the Linux i2c-dev character device.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::model::{Source, ZONES_PER_UNIT};

/// Errors surfaced by a hardware runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The bus device could not be opened or addressed.
    #[error("i2c bus error: {0}")]
    Bus(String),

    /// A register write was rejected by the board.
    #[error("preamp register write failed: {0}")]
    Write(String),

    /// Injected failure from the mock runtime.
    #[error("mock failure on {0}")]
    Mock(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl From<RuntimeError> for crate::error::ApiError {
    fn from(e: RuntimeError) -> Self {
        crate::error::ApiError::HardwareFailure {
            reason: e.to_string(),
            rolled_back: true,
        }
    }
}

/// Capability set the controller uses to effect physical change.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Enables or disables the 9V audio rail and the 5V USB rail.
    async fn set_power(&self, audio_on: bool, usb_on: bool) -> RuntimeResult<()>;

    /// Configures one of the four system sources; `digital` selects the
    /// digital input path instead of the analog RCA pair.
    async fn set_source(&self, source_id: usize, digital: bool) -> RuntimeResult<()>;

    /// Configures a single zone: routing, mute, standby, attenuation,
    /// and whether the output is disabled entirely.
    async fn set_zone(
        &self,
        zone_id: usize,
        source_id: usize,
        mute: bool,
        stby: bool,
        vol: i8,
        disabled: bool,
    ) -> RuntimeResult<()>;

    /// Batch-configures all four sources, used on preset load and boot.
    async fn update_sources(&self, sources: &[Source]) -> RuntimeResult<()>;

    /// Number of 6-zone amplifier units detected at boot.
    fn unit_count(&self) -> usize;
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock runtime
// ─────────────────────────────────────────────────────────────────────────────

/// Arguments of the most recent `set_zone` call, recorded by the mock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneCall {
    pub source_id: usize,
    pub mute: bool,
    pub stby: bool,
    pub vol: i8,
    pub disabled: bool,
}

/// Runtime that always succeeds and records the last argument per call.
///
/// Zone failures can be injected per zone id to exercise the controller's
/// rollback path.
#[derive(Default)]
pub struct MockRuntime {
    units: usize,
    pub last_power: Mutex<Option<(bool, bool)>>,
    pub last_source: Mutex<HashMap<usize, bool>>,
    pub last_zone: Mutex<HashMap<usize, ZoneCall>>,
    /// Count of `set_zone` calls, across all zones.
    pub zone_calls: Mutex<usize>,
    fail_zones: Mutex<Vec<usize>>,
}

impl MockRuntime {
    pub fn new(units: usize) -> Self {
        MockRuntime {
            units: units.max(1),
            ..Default::default()
        }
    }

    /// Makes every subsequent `set_zone` on `zone_id` fail.
    pub fn fail_zone(&self, zone_id: usize) {
        self.fail_zones.lock().push(zone_id);
    }

    /// Clears injected failures.
    pub fn heal(&self) {
        self.fail_zones.lock().clear();
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn set_power(&self, audio_on: bool, usb_on: bool) -> RuntimeResult<()> {
        *self.last_power.lock() = Some((audio_on, usb_on));
        Ok(())
    }

    async fn set_source(&self, source_id: usize, digital: bool) -> RuntimeResult<()> {
        self.last_source.lock().insert(source_id, digital);
        Ok(())
    }

    async fn set_zone(
        &self,
        zone_id: usize,
        source_id: usize,
        mute: bool,
        stby: bool,
        vol: i8,
        disabled: bool,
    ) -> RuntimeResult<()> {
        if self.fail_zones.lock().contains(&zone_id) {
            return Err(RuntimeError::Mock(format!("set_zone({})", zone_id)));
        }
        *self.zone_calls.lock() += 1;
        self.last_zone.lock().insert(
            zone_id,
            ZoneCall {
                source_id,
                mute,
                stby,
                vol,
                disabled,
            },
        );
        Ok(())
    }

    async fn update_sources(&self, sources: &[Source]) -> RuntimeResult<()> {
        let mut last = self.last_source.lock();
        for source in sources {
            last.insert(source.id, source.is_digital());
        }
        Ok(())
    }

    fn unit_count(&self) -> usize {
        self.units
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Preamp hardware runtime
// ─────────────────────────────────────────────────────────────────────────────

/// Register page exposed by each 6-zone preamp unit.
///
/// Units are addressed at consecutive i2c addresses starting at
/// [`preamp::FIRST_UNIT_ADDR`]; zone n lives on unit n / 6, channel n % 6.
#[allow(dead_code)]
mod preamp {
    pub const FIRST_UNIT_ADDR: u16 = 0x08;
    /// One bit per source: set selects the digital input path.
    pub const REG_SRC_AD: u8 = 0x00;
    /// Source select for channels 1-3, two bits per channel.
    pub const REG_CH123_SRC: u8 = 0x01;
    /// Source select for channels 4-6, two bits per channel.
    pub const REG_CH456_SRC: u8 = 0x02;
    /// One mute bit per channel.
    pub const REG_MUTE: u8 = 0x03;
    /// One standby bit per channel.
    pub const REG_STANDBY: u8 = 0x04;
    /// Attenuation per channel, 0..=79 dB, one register each.
    pub const REG_CH1_ATTEN: u8 = 0x05;
    /// Power rail control, unit 0 only: bit0 = 9V audio, bit1 = 5V usb.
    pub const REG_POWER: u8 = 0x0B;
}

/// Cached mirror of one unit's shared bitfield registers, so per-zone
/// updates can read-modify-write without a bus read.
#[derive(Debug, Clone, Copy, Default)]
struct UnitShadow {
    ch123_src: u8,
    ch456_src: u8,
    mute: u8,
    standby: u8,
}

/// Runtime driving the preamp board over `/dev/i2c-*`.
///
/// Disabled zones are expressed as muted and in standby; the board has no
/// dedicated disable register.
pub struct PreampRuntime {
    bus: Mutex<bus::I2cBus>,
    units: usize,
    shadow: Mutex<Vec<UnitShadow>>,
}

impl PreampRuntime {
    /// Opens the bus and probes for chained units by addressing each unit
    /// page in turn; the first page that does not answer ends the chain.
    pub fn open(device: &str) -> RuntimeResult<PreampRuntime> {
        let mut bus = bus::I2cBus::open(device)?;
        let mut units = 0;
        for unit in 0..crate::model::MAX_UNITS {
            let addr = preamp::FIRST_UNIT_ADDR + unit as u16;
            if bus.probe(addr) {
                units += 1;
            } else {
                break;
            }
        }
        if units == 0 {
            return Err(RuntimeError::Bus(format!(
                "no preamp units answered on {}",
                device
            )));
        }
        log::info!("[Preamp] {} unit(s) detected on {}", units, device);
        Ok(PreampRuntime {
            bus: Mutex::new(bus),
            units,
            shadow: Mutex::new(vec![UnitShadow::default(); units]),
        })
    }

    fn write_reg(&self, unit: usize, reg: u8, value: u8) -> RuntimeResult<()> {
        let addr = preamp::FIRST_UNIT_ADDR + unit as u16;
        self.bus.lock().write_reg(addr, reg, value)
    }
}

#[async_trait]
impl Runtime for PreampRuntime {
    async fn set_power(&self, audio_on: bool, usb_on: bool) -> RuntimeResult<()> {
        let value = (audio_on as u8) | ((usb_on as u8) << 1);
        self.write_reg(0, preamp::REG_POWER, value)
    }

    async fn set_source(&self, source_id: usize, digital: bool) -> RuntimeResult<()> {
        // The A/D select register is replicated on every unit; only the
        // addressed source's bit is touched.
        let mask = 1u8 << source_id;
        let bits = (digital as u8) << source_id;
        let mut bus = self.bus.lock();
        for unit in 0..self.units {
            bus.update_reg(
                preamp::FIRST_UNIT_ADDR + unit as u16,
                preamp::REG_SRC_AD,
                mask,
                bits,
            )?;
        }
        Ok(())
    }

    async fn set_zone(
        &self,
        zone_id: usize,
        source_id: usize,
        mute: bool,
        stby: bool,
        vol: i8,
        disabled: bool,
    ) -> RuntimeResult<()> {
        let unit = zone_id / ZONES_PER_UNIT;
        let ch = zone_id % ZONES_PER_UNIT;
        if unit >= self.units {
            return Err(RuntimeError::Write(format!(
                "zone {} beyond detected units",
                zone_id
            )));
        }
        let mut shadows = self.shadow.lock();
        let shadow = &mut shadows[unit];

        // Two bits of source select per channel, split across two registers.
        let (reg, field) = if ch < 3 {
            (&mut shadow.ch123_src, ch)
        } else {
            (&mut shadow.ch456_src, ch - 3)
        };
        *reg &= !(0b11 << (field * 2));
        *reg |= (source_id as u8 & 0b11) << (field * 2);
        let src_reg = if ch < 3 {
            preamp::REG_CH123_SRC
        } else {
            preamp::REG_CH456_SRC
        };
        let src_val = if ch < 3 {
            shadow.ch123_src
        } else {
            shadow.ch456_src
        };

        let bit = 1u8 << ch;
        if mute || disabled {
            shadow.mute |= bit;
        } else {
            shadow.mute &= !bit;
        }
        if stby || disabled {
            shadow.standby |= bit;
        } else {
            shadow.standby &= !bit;
        }
        let atten = (-(vol as i16)) as u8; // 0..=79
        let (mute_val, standby_val) = (shadow.mute, shadow.standby);
        drop(shadows);

        self.write_reg(unit, src_reg, src_val)?;
        self.write_reg(unit, preamp::REG_MUTE, mute_val)?;
        self.write_reg(unit, preamp::REG_STANDBY, standby_val)?;
        self.write_reg(unit, preamp::REG_CH1_ATTEN + ch as u8, atten)?;
        Ok(())
    }

    async fn update_sources(&self, sources: &[Source]) -> RuntimeResult<()> {
        let mut ad = 0u8;
        for source in sources {
            ad |= (source.is_digital() as u8) << source.id;
        }
        for unit in 0..self.units {
            self.write_reg(unit, preamp::REG_SRC_AD, ad)?;
        }
        Ok(())
    }

    fn unit_count(&self) -> usize {
        self.units
    }
}

/// Thin i2c-dev wrapper. Linux-only; on other targets every operation
/// reports a bus error so the mock runtime must be used instead.
mod bus {
    use super::{RuntimeError, RuntimeResult};

    pub struct I2cBus {
        #[cfg(target_os = "linux")]
        file: std::fs::File,
        #[cfg(target_os = "linux")]
        current_addr: Option<u16>,
    }

    #[cfg(target_os = "linux")]
    impl I2cBus {
        const I2C_SLAVE: libc::c_ulong = 0x0703;

        pub fn open(device: &str) -> RuntimeResult<I2cBus> {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(device)
                .map_err(|e| RuntimeError::Bus(format!("{}: {}", device, e)))?;
            Ok(I2cBus {
                file,
                current_addr: None,
            })
        }

        fn select(&mut self, addr: u16) -> RuntimeResult<()> {
            use std::os::unix::io::AsRawFd;
            if self.current_addr == Some(addr) {
                return Ok(());
            }
            let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), Self::I2C_SLAVE, addr as libc::c_ulong) };
            if rc < 0 {
                return Err(RuntimeError::Bus(format!(
                    "select addr {:#04x}: {}",
                    addr,
                    std::io::Error::last_os_error()
                )));
            }
            self.current_addr = Some(addr);
            Ok(())
        }

        pub fn probe(&mut self, addr: u16) -> bool {
            use std::io::Read;
            if self.select(addr).is_err() {
                return false;
            }
            let mut byte = [0u8; 1];
            self.file.read_exact(&mut byte).is_ok()
        }

        pub fn write_reg(&mut self, addr: u16, reg: u8, value: u8) -> RuntimeResult<()> {
            use std::io::Write;
            self.select(addr)?;
            self.file
                .write_all(&[reg, value])
                .map_err(|e| RuntimeError::Write(format!("reg {:#04x}: {}", reg, e)))
        }

        pub fn read_reg(&mut self, addr: u16, reg: u8) -> RuntimeResult<u8> {
            use std::io::{Read, Write};
            self.select(addr)?;
            self.file
                .write_all(&[reg])
                .map_err(|e| RuntimeError::Write(format!("reg {:#04x}: {}", reg, e)))?;
            let mut byte = [0u8; 1];
            self.file
                .read_exact(&mut byte)
                .map_err(|e| RuntimeError::Bus(format!("reg {:#04x}: {}", reg, e)))?;
            Ok(byte[0])
        }

        /// Read-modify-write of the masked bits of a register.
        pub fn update_reg(&mut self, addr: u16, reg: u8, mask: u8, bits: u8) -> RuntimeResult<()> {
            let current = self.read_reg(addr, reg)?;
            self.write_reg(addr, reg, (current & !mask) | (bits & mask))
        }
    }

    #[cfg(not(target_os = "linux"))]
    impl I2cBus {
        pub fn open(device: &str) -> RuntimeResult<I2cBus> {
            Err(RuntimeError::Bus(format!(
                "i2c unsupported on this platform ({})",
                device
            )))
        }

        pub fn probe(&mut self, _addr: u16) -> bool {
            false
        }

        pub fn write_reg(&mut self, _addr: u16, _reg: u8, _value: u8) -> RuntimeResult<()> {
            Err(RuntimeError::Bus("i2c unsupported on this platform".into()))
        }

        pub fn read_reg(&mut self, _addr: u16, _reg: u8) -> RuntimeResult<u8> {
            Err(RuntimeError::Bus("i2c unsupported on this platform".into()))
        }

        pub fn update_reg(&mut self, _addr: u16, _reg: u8, _mask: u8, _bits: u8) -> RuntimeResult<()> {
            Err(RuntimeError::Bus("i2c unsupported on this platform".into()))
        }
    }
}
