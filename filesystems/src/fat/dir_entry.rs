// Directory entry codec
//
// Pure byte-level encoding and decoding of 32-byte FAT directory entries.
// No I/O happens here; callers hand in the entry slot as a slice.

use byteorder::{ByteOrder, LittleEndian};
use fathom_core::FsError;

use super::volume::FatType;

pub const DIR_ENTRY_SIZE: usize = 32;

/// First byte of a deleted entry.
pub const DELETED_MARK: u8 = 0xE5;
/// First byte of the entry terminating a directory listing.
pub const END_OF_DIRECTORY: u8 = 0x00;
/// A literal 0xE5 in the first name byte is stored as 0x05 on disk.
const ESCAPED_E5: u8 = 0x05;

const NAME_LEN: usize = 8;
const EXT_LEN: usize = 3;
pub const SHORT_NAME_LEN: usize = NAME_LEN + EXT_LEN;

pub const ATTRIBUTES_OFFSET: usize = 0x0B;
pub const CLUSTER_HIGH_OFFSET: usize = 0x14;
pub const CLUSTER_LOW_OFFSET: usize = 0x1A;
pub const LENGTH_OFFSET: usize = 0x1C;

/// Attribute byte flags.
pub mod attributes {
    pub const READ_ONLY: u8 = 0x01;
    pub const HIDDEN: u8 = 0x02;
    pub const SYSTEM: u8 = 0x04;
    pub const VOLUME_ID: u8 = 0x08;
    pub const SUB_DIR: u8 = 0x10;
    pub const ARCHIVE: u8 = 0x20;
}

/// Decoded view of a directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub attributes: u8,
    pub first_cluster: u32,
    pub length: u32,
}

impl DirEntry {
    pub fn decode(slot: &[u8], fat_type: FatType) -> Self {
        DirEntry {
            name: decode_short_name(&slot[..SHORT_NAME_LEN]),
            attributes: slot[ATTRIBUTES_OFFSET],
            first_cluster: read_first_cluster(slot, fat_type),
            length: LittleEndian::read_u32(&slot[LENGTH_OFFSET..]),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & attributes::SUB_DIR != 0
    }

    pub fn is_volume_label(&self) -> bool {
        self.attributes & attributes::VOLUME_ID != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.attributes & attributes::READ_ONLY != 0
    }
}

/// Turn the 11 on-disk name bytes back into `NAME.EXT` form. The dot is
/// appended only when the extension field is non-blank.
pub fn decode_short_name(raw: &[u8]) -> String {
    let mut name = String::with_capacity(SHORT_NAME_LEN + 1);
    for (i, &byte) in raw[..NAME_LEN].iter().enumerate() {
        if byte == b' ' {
            break;
        }
        if i == 0 && byte == ESCAPED_E5 {
            name.push(0xE5 as char);
        } else {
            name.push(byte as char);
        }
    }
    if raw[NAME_LEN] != b' ' {
        name.push('.');
        for &byte in &raw[NAME_LEN..SHORT_NAME_LEN] {
            if byte == b' ' {
                break;
            }
            name.push(byte as char);
        }
    }
    name
}

/// Encode `NAME.EXT` into the 11 on-disk bytes: base left-justified into
/// eight, extension into three, both space padded. The name must already
/// be upper case; at most one dot separates base and extension.
pub fn encode_short_name(name: &str) -> Result<[u8; SHORT_NAME_LEN], FsError> {
    let invalid = || FsError::InvalidFilename(name.to_string());

    // Names are Latin-1 on disk; map each char down to one byte
    let mut bytes = Vec::with_capacity(name.len());
    for c in name.chars() {
        if c as u32 > 0xFF {
            return Err(invalid());
        }
        bytes.push(c as u8);
    }

    let dot = bytes.iter().position(|&b| b == b'.');
    let (base, ext): (&[u8], &[u8]) = match dot {
        Some(i) => (&bytes[..i], &bytes[i + 1..]),
        None => (&bytes[..], &[]),
    };
    if base.is_empty() || base.len() > NAME_LEN || ext.len() > EXT_LEN {
        return Err(invalid());
    }
    // A dot with nothing after it, or a second dot in the extension
    if (dot.is_some() && ext.is_empty()) || ext.contains(&b'.') {
        return Err(invalid());
    }
    if !base.iter().copied().all(is_valid_83_byte) || !ext.iter().copied().all(is_valid_83_byte) {
        return Err(invalid());
    }

    let mut encoded = [b' '; SHORT_NAME_LEN];
    encoded[..base.len()].copy_from_slice(base);
    encoded[NAME_LEN..NAME_LEN + ext.len()].copy_from_slice(ext);
    if encoded[0] == DELETED_MARK {
        encoded[0] = ESCAPED_E5;
    }
    Ok(encoded)
}

fn is_valid_83_byte(byte: u8) -> bool {
    match byte {
        b'A'..=b'Z' | b'0'..=b'9' => true,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'(' | b')' | b'-' | b'@' | b'^' | b'_'
        | b'`' | b'{' | b'}' | b'~' => true,
        0x80..=0xFF => true,
        _ => false,
    }
}

/// Start cluster of an entry. FAT16 stores only the low word; the high
/// word at 0x14 is reserved there and must be ignored.
pub fn read_first_cluster(slot: &[u8], fat_type: FatType) -> u32 {
    let low = LittleEndian::read_u16(&slot[CLUSTER_LOW_OFFSET..]) as u32;
    match fat_type {
        FatType::Fat16 => low,
        FatType::Fat32 => {
            let high = LittleEndian::read_u16(&slot[CLUSTER_HIGH_OFFSET..]) as u32;
            (high << 16) | low
        }
    }
}

pub fn write_first_cluster(slot: &mut [u8], fat_type: FatType, cluster: u32) {
    LittleEndian::write_u16(&mut slot[CLUSTER_LOW_OFFSET..], cluster as u16);
    if fat_type == FatType::Fat32 {
        LittleEndian::write_u16(&mut slot[CLUSTER_HIGH_OFFSET..], (cluster >> 16) as u16);
    }
}

pub fn read_length(slot: &[u8]) -> u32 {
    LittleEndian::read_u32(&slot[LENGTH_OFFSET..])
}

pub fn write_length(slot: &mut [u8], length: u32) {
    LittleEndian::write_u32(&mut slot[LENGTH_OFFSET..], length);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_pads_base_and_extension_with_spaces() {
        assert_eq!(encode_short_name("HI.TXT").unwrap(), *b"HI      TXT");
        assert_eq!(encode_short_name("README").unwrap(), *b"README     ");
        assert_eq!(encode_short_name("DATAFILE.BIN").unwrap(), *b"DATAFILEBIN");
    }

    #[test]
    fn decode_round_trips_valid_names() {
        for name in ["HI.TXT", "README", "A", "LONGNAME.X", "FILE_1.C", "8LETTERS.EXT"] {
            let encoded = encode_short_name(name).unwrap();
            assert_eq!(decode_short_name(&encoded), name, "round trip of {name}");
        }
    }

    #[test]
    fn decode_skips_dot_for_blank_extension() {
        assert_eq!(decode_short_name(b"NOEXT      "), "NOEXT");
        assert_eq!(decode_short_name(b"WITH    EXT"), "WITH.EXT");
    }

    #[test]
    fn leading_e5_is_escaped_and_unescaped() {
        let raw = *b"\x05BC        ";
        let decoded = decode_short_name(&raw[..SHORT_NAME_LEN]);
        assert_eq!(decoded.chars().next(), Some(0xE5 as char));

        let name: String = [0xE5 as char, 'B', 'C'].iter().collect();
        let encoded = encode_short_name(&name).unwrap();
        assert_eq!(encoded[0], 0x05);
        assert_eq!(decode_short_name(&encoded), name);
    }

    #[test]
    fn invalid_names_are_rejected() {
        for name in [
            "",
            "TOOLONGNAME.TXT",
            "HI.TEXT",
            "HI.",
            "A.B.C",
            "lower.txt",
            "BAD NAME",
            "NUL\0",
        ] {
            assert!(
                matches!(encode_short_name(name), Err(FsError::InvalidFilename(_))),
                "{name:?} should be invalid"
            );
        }
    }

    #[test]
    fn first_cluster_width_depends_on_variant() {
        let mut slot = [0u8; DIR_ENTRY_SIZE];
        write_first_cluster(&mut slot, FatType::Fat32, 0x0012_3456);
        assert_eq!(read_first_cluster(&slot, FatType::Fat32), 0x0012_3456);
        // FAT16 readers must ignore the high word
        assert_eq!(read_first_cluster(&slot, FatType::Fat16), 0x3456);

        let mut slot16 = [0u8; DIR_ENTRY_SIZE];
        write_first_cluster(&mut slot16, FatType::Fat16, 0xBEEF);
        assert_eq!(slot16[CLUSTER_HIGH_OFFSET], 0);
        assert_eq!(read_first_cluster(&slot16, FatType::Fat16), 0xBEEF);
    }

    #[test]
    fn decode_reads_attributes_cluster_and_length() {
        let mut slot = [0u8; DIR_ENTRY_SIZE];
        slot[..11].copy_from_slice(b"HELLO   TXT");
        slot[ATTRIBUTES_OFFSET] = attributes::ARCHIVE | attributes::READ_ONLY;
        write_first_cluster(&mut slot, FatType::Fat16, 42);
        write_length(&mut slot, 1234);

        let entry = DirEntry::decode(&slot, FatType::Fat16);
        assert_eq!(entry.name, "HELLO.TXT");
        assert_eq!(entry.first_cluster, 42);
        assert_eq!(entry.length, 1234);
        assert!(entry.is_read_only());
        assert!(!entry.is_directory());
    }
}
