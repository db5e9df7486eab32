extern crate libc;
use std::io::Write;

pub fn localtime_r(seconds: i64, tm: &mut libc::tm) {
    let t = seconds as libc::time_t;
    unsafe {
        libc::localtime_r(&t, tm);
    }
}
pub fn gmtime_r(seconds: i64, tm: &mut libc::tm) {
    let t = seconds as libc::time_t;
    unsafe {
        libc::gmtime_r(&t, tm);
    }
}

/// Format `nownanos` as `YYYYmmdd-HH:MM:SS[.fraction]` into `buffer`.
pub fn format_time(
    buffer: &mut [u8],
    nownanos: i64,
    subsecond_digits: u32, // only be 0, 3, 6, 9
    gmt_time: bool,
) -> &str {
    debug_assert!(
        subsecond_digits == 0
            || subsecond_digits == 3
            || subsecond_digits == 6
            || subsecond_digits == 9
    );
    debug_assert!(buffer.len() as u32 > 17 + subsecond_digits + 1);
    let (seconds, nanos) = (nownanos / 1000000000, nownanos % 1000000000);
    let mut tm: libc::tm = unsafe { std::mem::MaybeUninit::zeroed().assume_init() };

    if gmt_time {
        gmtime_r(seconds, &mut tm);
    } else {
        localtime_r(seconds, &mut tm);
    }
    let mut n = 0usize;
    if write!(
        &mut buffer[..],
        "{:04}{:02}{:02}-{:02}:{:02}:{:02}",
        (tm.tm_year + 1900),
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
    .is_ok()
    {
        n = 17;
    }
    let res = match subsecond_digits {
        3 => write!(&mut buffer[n..], ".{:03}", nanos / 1000000),
        6 => write!(&mut buffer[n..], ".{:06}", nanos / 1000),
        9 => write!(&mut buffer[n..], ".{:09}", nanos),
        _ => Ok(()),
    };
    if res.is_ok() && subsecond_digits > 0 {
        n += subsecond_digits as usize + 1;
    }
    std::str::from_utf8(&buffer[..n]).unwrap_or("")
}

/// `YYYYmmdd` of local date, used to name log files.
pub fn format_date(nownanos: i64) -> String {
    let mut tm: libc::tm = unsafe { std::mem::MaybeUninit::zeroed().assume_init() };
    localtime_r(nownanos / 1000000000, &mut tm);
    format!(
        "{:04}{:02}{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday
    )
}

pub fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Wall clock milliseconds. Timer arrival times are expressed in it.
pub fn now_millis() -> i64 {
    now_nanos() / 1000000
}

/// Kernel thread id of the caller.
pub fn thread_id() -> i64 {
    unsafe { libc::syscall(libc::SYS_gettid) as i64 }
}

#[macro_export]
macro_rules! logmsg {
    ($($arg:tt)*) => {
        if $crate::logger::enabled($crate::logger::LogLevel::Info) {
            $crate::logger::log_line(
                $crate::logger::LogLevel::Info,
                file!(),
                line!(),
                format_args!($($arg)*),
            );
        }
    };
}

#[macro_export]
macro_rules! logerr {
    ($($arg:tt)*) => {
        if $crate::logger::enabled($crate::logger::LogLevel::Error) {
            $crate::logger::log_line(
                $crate::logger::LogLevel::Error,
                file!(),
                line!(),
                format_args!($($arg)*),
            );
        }
    };
}

#[macro_export]
/// log only in debug mode.
#[cfg(debug_assertions)]
macro_rules! dbglog {
    ($($arg:tt)*) => {
        if $crate::logger::enabled($crate::logger::LogLevel::Debug) {
            $crate::logger::log_line(
                $crate::logger::LogLevel::Debug,
                file!(),
                line!(),
                format_args!($($arg)*),
            );
        }
    };
}
#[allow(unused_macros)]
#[macro_export]
#[cfg(not(debug_assertions))]
macro_rules! dbglog {
    ($($arg:tt)*) => {
        ()
    };
}
