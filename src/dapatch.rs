//! Neutralizes security checks compiled into a Download Agent image before
//! it boots. These are literal byte signatures from a specific firmware
//! build; keep them as data, generalizing the matching would change exploit
//! behavior.

/// Single-shot (pattern, replacement) pairs. The replacement is written at
/// the match offset and may run past the pattern, as with the version check
/// below where the forced `return 0` needs two extra bytes.
const DA_PATCHES: &[(&[u8], &[u8])] = &[
    // RAM blacklist check: force the loaded flag to 1.
    (
        &[0x10, 0xb5, 0x0c, 0x68],
        &[0x10, 0xb5, 0x01, 0x20],
    ),
    // DA version check: return 0 immediately.
    (
        &[0x1f, 0xb5, 0x00, 0x23, 0x01, 0xa8],
        &[0x00, 0x20, 0x70, 0x47, 0x00, 0x23, 0x01, 0xa8],
    ),
];

/// Comparison constants zeroed wherever they appear: the hash-check and
/// anti-rollback magics.
const DA_ZERO_MAGICS: &[u32] = &[0xc007_0004, 0xc002_0053];

/// Best-effort patching: a missing pattern is not an error. Always returns
/// an owned (possibly unmodified) copy.
pub fn patch_da_security(da: &[u8]) -> Vec<u8> {
    let mut data = da.to_vec();

    for &(pattern, replacement) in DA_PATCHES {
        match find(&data, pattern) {
            Some(offset) if offset + replacement.len() <= data.len() => {
                tracing::debug!("DA patch {pattern:02x?} applied at {offset:#x}");
                data[offset..offset + replacement.len()].copy_from_slice(replacement);
            }
            _ => tracing::debug!("DA patch {pattern:02x?} not applicable"),
        }
    }

    for &magic in DA_ZERO_MAGICS {
        let needle = magic.to_le_bytes();
        let mut base = 0;
        while let Some(offset) = find(&data[base..], &needle) {
            let at = base + offset;
            data[at..at + 4].fill(0);
            base = at + 4;
        }
    }

    data
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_pattern_replaced_in_place() {
        let input = [0xff, 0x10, 0xb5, 0x0c, 0x68, 0xff];
        let patched = patch_da_security(&input);
        assert_eq!(patched, [0xff, 0x10, 0xb5, 0x01, 0x20, 0xff]);
    }

    #[test]
    fn version_check_replacement_overruns_pattern() {
        let mut input = vec![0x1f, 0xb5, 0x00, 0x23, 0x01, 0xa8, 0xee, 0xdd];
        input.extend_from_slice(&[0xcc; 4]);

        let patched = patch_da_security(&input);
        assert_eq!(
            &patched[..8],
            &[0x00, 0x20, 0x70, 0x47, 0x00, 0x23, 0x01, 0xa8]
        );
        assert_eq!(&patched[8..], &[0xcc; 4]);
    }

    #[test]
    fn magic_constants_zeroed_everywhere() {
        let mut input = Vec::new();
        input.extend_from_slice(&0xc007_0004u32.to_le_bytes());
        input.push(0x77);
        input.extend_from_slice(&0xc002_0053u32.to_le_bytes());
        input.extend_from_slice(&0xc007_0004u32.to_le_bytes());

        let patched = patch_da_security(&input);
        assert_eq!(patched, [0, 0, 0, 0, 0x77, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn missing_patterns_leave_image_untouched() {
        let input = vec![0x01, 0x02, 0x03, 0x04, 0x05];
        assert_eq!(patch_da_security(&input), input);
    }

    #[test]
    fn only_first_pattern_match_is_replaced() {
        let mut input = vec![0x10, 0xb5, 0x0c, 0x68];
        input.extend_from_slice(&[0x10, 0xb5, 0x0c, 0x68]);

        let patched = patch_da_security(&input);
        assert_eq!(&patched[..4], &[0x10, 0xb5, 0x01, 0x20]);
        assert_eq!(&patched[4..], &[0x10, 0xb5, 0x0c, 0x68]);
    }
}
