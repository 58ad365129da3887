use std::fs::File;
use std::io::{self, Read, Write};

use bytes::{Buf, BufMut};

/// Parse a decimal number, or a hex number with a `0x` prefix.
pub fn parse_num(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<u64>().ok()
    }
}

/// Parse a hex number, the `0x` prefix is optional.
pub fn parse_hex(s: &str) -> Option<u64> {
    let s = s.trim();
    let hex = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(hex, 16).ok()
}

pub fn named_signal(sig: i32) -> String {
    match signal_hook::low_level::signal_name(sig) {
        Some(name) => name.to_string(),
        None => format!("signal {}", sig),
    }
}

/// Contents of the memory map of current process.
pub fn dump_maps() -> io::Result<String> {
    let mut maps = String::new();
    File::open("/proc/self/maps")?.read_to_string(&mut maps)?;
    Ok(maps)
}

/// Read one control word in host byte order.
pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0; 4];
    r.read_exact(&mut buf)?;
    let mut b = &buf[..];
    if cfg!(target_endian = "little") {
        Ok(b.get_u32_le())
    } else {
        Ok(b.get_u32())
    }
}

/// Write one control word in host byte order.
pub fn write_u32<W: Write>(w: &mut W, val: u32) -> io::Result<()> {
    let mut buf = Vec::with_capacity(4);
    if cfg!(target_endian = "little") {
        buf.put_u32_le(val);
    } else {
        buf.put_u32(val);
    }
    w.write_all(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers() {
        assert_eq!(parse_num("4096"), Some(4096));
        assert_eq!(parse_num("0x1000"), Some(0x1000));
        assert_eq!(parse_num(" 0X10 "), Some(16));
        assert_eq!(parse_num("1000h"), None);
        assert_eq!(parse_hex("1000"), Some(0x1000));
        assert_eq!(parse_hex("0xdeadbeef"), Some(0xdead_beef));
        assert_eq!(parse_hex("xyz"), None);
    }

    #[test]
    fn control_words() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 0x8000_0001).unwrap();
        assert_eq!(buf, 0x8000_0001_u32.to_ne_bytes());
        let mut r = &buf[..];
        assert_eq!(read_u32(&mut r).unwrap(), 0x8000_0001);
        assert!(read_u32(&mut r).is_err());
    }

    #[test]
    fn signal_names() {
        assert_eq!(named_signal(nix::libc::SIGSTOP), "SIGSTOP");
        assert_eq!(named_signal(9999), "signal 9999");
    }
}
