//! GUID partition table decoding from a raw flash dump.

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

const HEADER_ENTRIES_LBA: usize = 72;
const HEADER_NUM_ENTRIES: usize = 80;
const HEADER_ENTRY_SIZE: usize = 84;

const ENTRY_FIRST_LBA: usize = 32;
const ENTRY_LAST_LBA: usize = 40;
const ENTRY_NAME: usize = 56;
const ENTRY_NAME_LEN: usize = 72;

#[derive(Debug, thiserror::Error)]
#[error("No valid GPT header found in flash dump")]
pub struct GptNotFound;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub first_lba: u64,
    pub last_lba: u64,
}

impl Partition {
    pub fn sectors(&self) -> u64 {
        self.last_lba - self.first_lba + 1
    }

    pub fn size_bytes(&self, sector_size: u64) -> u64 {
        self.sectors() * sector_size
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

fn utf16le_name(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Searches candidate sector sizes for the GPT header, then decodes every
/// non-empty entry. Returns the effective sector size alongside the entries.
pub fn parse_gpt(
    data: &[u8],
    sector_size: usize,
) -> Result<(usize, Vec<Partition>), GptNotFound> {
    let mut gpt_offset = None;
    for candidate in [sector_size, 512, 4096] {
        if data.len() >= candidate + 92 && &data[candidate..candidate + 8] == GPT_SIGNATURE {
            gpt_offset = Some(candidate);
            break;
        }
    }
    let Some(gpt_offset) = gpt_offset else {
        return Err(GptNotFound);
    };

    // The signature offset doubles as the effective sector size.
    let sector_size = gpt_offset;

    let entries_lba = read_u64(data, gpt_offset + HEADER_ENTRIES_LBA);
    let num_entries = read_u32(data, gpt_offset + HEADER_NUM_ENTRIES) as usize;
    let entry_size = read_u32(data, gpt_offset + HEADER_ENTRY_SIZE) as usize;

    // Header fields come straight off flash; an entry too small to hold the
    // name field cannot be decoded.
    if entry_size < ENTRY_NAME + ENTRY_NAME_LEN {
        return Err(GptNotFound);
    }
    let Some(entries_offset) = (entries_lba as usize).checked_mul(sector_size) else {
        return Err(GptNotFound);
    };

    let mut partitions = Vec::new();
    for index in 0..num_entries {
        let Some(offset) = index
            .checked_mul(entry_size)
            .and_then(|relative| relative.checked_add(entries_offset))
        else {
            break;
        };
        let Some(end) = offset.checked_add(entry_size) else {
            break;
        };
        if end > data.len() {
            break;
        }

        let entry = &data[offset..end];
        if entry[..16].iter().all(|&byte| byte == 0) {
            continue;
        }

        partitions.push(Partition {
            name: utf16le_name(&entry[ENTRY_NAME..ENTRY_NAME + ENTRY_NAME_LEN]),
            first_lba: read_u64(entry, ENTRY_FIRST_LBA),
            last_lba: read_u64(entry, ENTRY_LAST_LBA),
        });
    }

    Ok((sector_size, partitions))
}


#[cfg(test)]
mod tests {
    use super::testing::synthetic_gpt;
    use super::*;

    #[test]
    fn parses_single_entry_table() {
        let data = synthetic_gpt(512, 0x4000, &[("frp", 100, 101)]);

        let (sector_size, partitions) = parse_gpt(&data, 512).unwrap();
        assert_eq!(sector_size, 512);
        assert_eq!(partitions.len(), 1);

        let frp = &partitions[0];
        assert_eq!(frp.name, "frp");
        assert_eq!(frp.first_lba, 100);
        assert_eq!(frp.last_lba, 101);
        assert_eq!(frp.sectors(), 2);
        assert_eq!(frp.size_bytes(sector_size as u64), 1024);
    }

    #[test]
    fn falls_back_to_alternate_sector_sizes() {
        let data = synthetic_gpt(4096, 0x8000, &[("boot", 10, 20)]);

        let (sector_size, partitions) = parse_gpt(&data, 512).unwrap();
        assert_eq!(sector_size, 4096);
        assert_eq!(partitions[0].name, "boot");
    }

    #[test]
    fn empty_entries_are_skipped() {
        let mut data = synthetic_gpt(512, 0x4000, &[("frp", 100, 101)]);
        // Grow the declared entry count past the single populated entry.
        data[512 + HEADER_NUM_ENTRIES..512 + HEADER_NUM_ENTRIES + 4]
            .copy_from_slice(&4u32.to_le_bytes());

        let (_, partitions) = parse_gpt(&data, 512).unwrap();
        assert_eq!(partitions.len(), 1);
    }

    #[test]
    fn missing_signature_is_an_error() {
        let data = vec![0u8; 0x4000];
        assert!(parse_gpt(&data, 512).is_err());
    }

    #[test]
    fn zero_entry_size_is_rejected() {
        let mut data = synthetic_gpt(512, 0x4000, &[("frp", 100, 101)]);
        data[512 + HEADER_ENTRY_SIZE..512 + HEADER_ENTRY_SIZE + 4]
            .copy_from_slice(&0u32.to_le_bytes());

        assert!(parse_gpt(&data, 512).is_err());
    }

    #[test]
    fn entry_size_below_name_field_is_rejected() {
        let mut data = synthetic_gpt(512, 0x4000, &[("frp", 100, 101)]);
        data[512 + HEADER_ENTRY_SIZE..512 + HEADER_ENTRY_SIZE + 4]
            .copy_from_slice(&64u32.to_le_bytes());

        assert!(parse_gpt(&data, 512).is_err());
    }

    #[test]
    fn entries_lba_overflow_is_rejected() {
        let mut data = synthetic_gpt(512, 0x4000, &[("frp", 100, 101)]);
        data[512 + HEADER_ENTRIES_LBA..512 + HEADER_ENTRIES_LBA + 8]
            .copy_from_slice(&u64::MAX.to_le_bytes());

        assert!(parse_gpt(&data, 512).is_err());
    }

    #[test]
    fn entry_array_past_end_of_dump_yields_no_partitions() {
        let mut data = synthetic_gpt(512, 0x4000, &[("frp", 100, 101)]);
        // Point the entry array far beyond the dump.
        data[512 + HEADER_ENTRIES_LBA..512 + HEADER_ENTRIES_LBA + 8]
            .copy_from_slice(&0x10_0000u64.to_le_bytes());

        let (_, partitions) = parse_gpt(&data, 512).unwrap();
        assert!(partitions.is_empty());
    }
}
