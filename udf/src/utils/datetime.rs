//! ECMA-167 timestamps (1/7.3)
//!
//! 12 bytes: type-and-timezone, year, month, day, hour, minute, second,
//! centiseconds, hundreds of microseconds, microseconds. Type 1 means local
//! time with a signed 12-bit minute offset from UTC; 0xFFF in the offset
//! field means "no timezone".

use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use super::sector::{read_u16, write_u16};

/// Size of an on-disk timestamp
pub const TIMESTAMP_SIZE: usize = 12;

const TZ_UNSPECIFIED: u16 = 0x0FFF;

/// Raw recorded timestamp
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdfTimestamp {
    /// Type (upper 4 bits) and timezone (lower 12 bits)
    pub type_and_timezone: u16,
    /// Year (1-9999)
    pub year: i16,
    /// Month (1-12)
    pub month: u8,
    /// Day (1-31)
    pub day: u8,
    /// Hour (0-23)
    pub hour: u8,
    /// Minute (0-59)
    pub minute: u8,
    /// Second (0-59)
    pub second: u8,
    /// Centiseconds (0-99)
    pub centiseconds: u8,
    /// Hundreds of microseconds (0-99)
    pub hundreds_of_microseconds: u8,
    /// Microseconds (0-99)
    pub microseconds: u8,
}

impl UdfTimestamp {
    /// Parse from the first 12 bytes of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            type_and_timezone: read_u16(bytes, 0),
            year: read_u16(bytes, 2) as i16,
            month: bytes[4],
            day: bytes[5],
            hour: bytes[6],
            minute: bytes[7],
            second: bytes[8],
            centiseconds: bytes[9],
            hundreds_of_microseconds: bytes[10],
            microseconds: bytes[11],
        }
    }

    /// Serialize into the first 12 bytes of `bytes`
    pub fn write_to(&self, bytes: &mut [u8]) {
        write_u16(bytes, 0, self.type_and_timezone);
        write_u16(bytes, 2, self.year as u16);
        bytes[4] = self.month;
        bytes[5] = self.day;
        bytes[6] = self.hour;
        bytes[7] = self.minute;
        bytes[8] = self.second;
        bytes[9] = self.centiseconds;
        bytes[10] = self.hundreds_of_microseconds;
        bytes[11] = self.microseconds;
    }

    /// Convert a wall-clock time to a type-1 timestamp
    pub fn from_datetime(dt: OffsetDateTime) -> Self {
        let offset_minutes = dt.offset().whole_minutes();
        let tz = (offset_minutes as u16) & 0x0FFF;
        let micros = dt.microsecond();
        Self {
            type_and_timezone: 0x1000 | tz,
            year: dt.year() as i16,
            month: u8::from(dt.month()),
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
            centiseconds: (micros / 10_000) as u8,
            hundreds_of_microseconds: ((micros / 100) % 100) as u8,
            microseconds: (micros % 100) as u8,
        }
    }

    /// Current UTC time
    pub fn now() -> Self {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    /// Interpret as a wall-clock time, if the fields are valid
    pub fn to_datetime(&self) -> Option<OffsetDateTime> {
        if self.type_and_timezone >> 12 != 1 {
            return None;
        }
        let month = Month::try_from(self.month).ok()?;
        let date = Date::from_calendar_date(i32::from(self.year), month, self.day).ok()?;
        if self.centiseconds > 99 || self.hundreds_of_microseconds > 99 || self.microseconds > 99 {
            return None;
        }
        let micros = u32::from(self.centiseconds) * 10_000
            + u32::from(self.hundreds_of_microseconds) * 100
            + u32::from(self.microseconds);
        let time = Time::from_hms_micro(self.hour, self.minute, self.second, micros).ok()?;
        let naive = PrimitiveDateTime::new(date, time);

        let tz = self.type_and_timezone & 0x0FFF;
        if tz == TZ_UNSPECIFIED {
            return Some(naive.assume_utc());
        }
        // sign-extend the 12-bit minute offset
        let minutes = ((tz << 4) as i16) >> 4;
        let offset = UtcOffset::from_whole_seconds(i32::from(minutes) * 60).ok()?;
        Some(naive.assume_offset(offset))
    }
}
