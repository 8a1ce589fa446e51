//! Context addresses
//!
//! Every execution context is named by a 16-byte, IPv6-shaped identifier.
//! They are not routable network addresses, but they are written and matched
//! exactly like IPv6 addresses so the packet format stays a real IPv6 header.

use core::fmt;
use core::str::FromStr;

use crate::error::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; 16]);

impl Address {
    pub const ZERO: Address = Address([0; 16]);

    /// Build an address from eight 16-bit groups
    pub const fn from_words(words: [u16; 8]) -> Self {
        let mut bytes = [0u8; 16];
        let mut i = 0;
        while i < 8 {
            bytes[2 * i] = (words[i] >> 8) as u8;
            bytes[2 * i + 1] = words[i] as u8;
            i += 1;
        }
        Address(bytes)
    }

    pub fn words(&self) -> [u16; 8] {
        let mut words = [0u16; 8];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u16::from_be_bytes([self.0[2 * i], self.0[2 * i + 1]]);
        }
        words
    }

    pub fn octets(&self) -> [u8; 16] {
        self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 16] = bytes.try_into().map_err(|_| Error::InvalidArg)?;
        Ok(Address(array))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] == 0xff
    }
}

impl fmt::Display for Address {
    /// Colon-hex groups with the longest zero run compressed
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = self.words();

        let mut best = (0usize, 0usize);
        let mut run_start = 0;
        let mut run_len = 0;
        for (i, word) in words.iter().enumerate() {
            if *word == 0 {
                if run_len == 0 {
                    run_start = i;
                }
                run_len += 1;
                if run_len > best.1 {
                    best = (run_start, run_len);
                }
            } else {
                run_len = 0;
            }
        }

        if best.1 < 2 {
            for (i, word) in words.iter().enumerate() {
                if i > 0 {
                    f.write_str(":")?;
                }
                write!(f, "{:x}", word)?;
            }
            return Ok(());
        }

        let (start, len) = best;
        for (i, word) in words[..start].iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:x}", word)?;
        }
        f.write_str("::")?;
        for (i, word) in words[start + len..].iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:x}", word)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        fn parse_groups(part: &str, out: &mut [u16; 8]) -> Result<usize> {
            if part.is_empty() {
                return Ok(0);
            }
            let mut count = 0;
            for group in part.split(':') {
                if count == 8 || group.is_empty() || group.len() > 4 {
                    return Err(Error::InvalidArg);
                }
                out[count] = u16::from_str_radix(group, 16).map_err(|_| Error::InvalidArg)?;
                count += 1;
            }
            Ok(count)
        }

        let mut words = [0u16; 8];
        match s.split_once("::") {
            None => {
                if parse_groups(s, &mut words)? != 8 {
                    return Err(Error::InvalidArg);
                }
            }
            Some((head, tail)) => {
                let mut head_words = [0u16; 8];
                let mut tail_words = [0u16; 8];
                let head_len = parse_groups(head, &mut head_words)?;
                let tail_len = parse_groups(tail, &mut tail_words)?;
                if head_len + tail_len > 7 {
                    return Err(Error::InvalidArg);
                }
                words[..head_len].copy_from_slice(&head_words[..head_len]);
                words[8 - tail_len..].copy_from_slice(&tail_words[..tail_len]);
            }
        }
        Ok(Address::from_words(words))
    }
}

/// An address prefix: the first `len` bits of `addr` are significant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressMask {
    pub addr: Address,
    pub len: u8,
}

impl AddressMask {
    pub const fn new(addr: Address, len: u8) -> Self {
        Self { addr, len }
    }

    /// Host mask matching exactly one address
    pub const fn host(addr: Address) -> Self {
        Self { addr, len: 128 }
    }

    pub fn matches(&self, other: &Address) -> bool {
        let len = (self.len as usize).min(128);
        let full = len / 8;
        if self.addr.0[..full] != other.0[..full] {
            return false;
        }

        let rest = len % 8;
        if rest == 0 {
            return true;
        }
        let bits = 0xffu8 << (8 - rest);
        (self.addr.0[full] & bits) == (other.0[full] & bits)
    }
}

impl fmt::Display for AddressMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_address_display_compresses_zero_run() {
        let addr = Address::from_words([0xfd00, 0, 0, 0, 0, 0, 0, 0x12]);
        assert_eq!(addr.to_string(), "fd00::12");
        assert_eq!(Address::ZERO.to_string(), "::");
        let full = Address::from_words([1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(full.to_string(), "1:2:3:4:5:6:7:8");
    }

    #[test]
    fn test_address_parse() {
        let addr: Address = "fd00::12".parse().unwrap();
        assert_eq!(addr, Address::from_words([0xfd00, 0, 0, 0, 0, 0, 0, 0x12]));
        let addr: Address = "1:2:3:4:5:6:7:8".parse().unwrap();
        assert_eq!(addr.words(), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert!("1:2:3".parse::<Address>().is_err());
        assert!("fd00::1::2".parse::<Address>().is_err());
        assert!("zz::1".parse::<Address>().is_err());
    }

    #[test]
    fn test_mask_matching() {
        let prefix = Address::from_words([0xfd00, 0x0001, 0, 0, 0, 0, 0, 0]);
        let inside = Address::from_words([0xfd00, 0x0001, 0, 0, 0, 0, 0, 7]);
        let outside = Address::from_words([0xfd00, 0x0002, 0, 0, 0, 0, 0, 7]);

        let mask = AddressMask::new(prefix, 32);
        assert!(mask.matches(&inside));
        assert!(!mask.matches(&outside));

        // A prefix that ends mid-byte.
        let mask = AddressMask::new(prefix, 30);
        assert!(mask.matches(&outside));

        assert!(AddressMask::new(prefix, 0).matches(&Address::ZERO));
        assert!(!AddressMask::host(inside).matches(&outside));
    }
}
