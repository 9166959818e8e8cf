//! Path conversions shared by the backends.
//!
//! Windows APIs take UTF-16 and reject classic paths longer than the legacy
//! limit unless they carry the `\\?\` prefix. Everything here works on plain
//! `u16` code units, so the logic behaves the same on every platform.

use widestring::{U16Str, U16String};

const SEP: u16 = b'\\' as u16;
const QUESTION: u16 = b'?' as u16;

/// `\\?\`
const LONG_PATH_PREFIX: &[u16] = &[SEP, SEP, QUESTION, SEP];
/// `\\?\UNC\`
const UNC_LONG_PATH_PREFIX: &[u16] = &[
    SEP,
    SEP,
    QUESTION,
    SEP,
    b'U' as u16,
    b'N' as u16,
    b'C' as u16,
    SEP,
];

// Some Win32 APIs working with directory paths already fail around 240
// characters, a bit before the documented MAX_PATH of 260, so the long form
// kicks in early enough to cover both.
const LONG_PATH_THRESHOLD: usize = 240;

pub fn utf8_to_utf16(path: &str) -> U16String {
    U16String::from_str(path)
}

pub fn utf16_to_utf8(path: &U16Str) -> String {
    path.to_string_lossy()
}

/// Converts a path to the `\\?\` form when it is too long for the classic
/// Win32 limit.
///
/// Paths that are short enough, already prefixed, or in some unrecognized
/// format come back unchanged.
pub fn to_long_path(path: &U16Str) -> U16String {
    let units = path.as_slice();
    if units.len() <= LONG_PATH_THRESHOLD || is_long_path(units) {
        return path.to_ustring();
    }

    if is_absolute_local_path(units) {
        // C:\... -> \\?\C:\...
        let mut converted = Vec::with_capacity(LONG_PATH_PREFIX.len() + units.len());
        converted.extend_from_slice(LONG_PATH_PREFIX);
        converted.extend_from_slice(units);
        U16String::from_vec(converted)
    } else if is_absolute_unc_path(units) {
        // \\server\share\... -> \\?\UNC\server\share\...
        let mut converted = Vec::with_capacity(UNC_LONG_PATH_PREFIX.len() + units.len() - 2);
        converted.extend_from_slice(UNC_LONG_PATH_PREFIX);
        converted.extend_from_slice(&units[2..]);
        U16String::from_vec(converted)
    } else {
        path.to_ustring()
    }
}

/// Inverse of [`to_long_path`], applied to every decoded event path so the
/// host never sees the prefixed form.
pub fn strip_long_path(path: &U16Str) -> U16String {
    let units = path.as_slice();
    if is_unc_long_path(units) {
        let mut stripped = Vec::with_capacity(units.len() - UNC_LONG_PATH_PREFIX.len() + 2);
        stripped.extend_from_slice(&[SEP, SEP]);
        stripped.extend_from_slice(&units[UNC_LONG_PATH_PREFIX.len()..]);
        U16String::from_vec(stripped)
    } else if is_long_path(units) {
        U16Str::from_slice(&units[LONG_PATH_PREFIX.len()..]).to_ustring()
    } else {
        path.to_ustring()
    }
}

fn is_absolute_local_path(units: &[u16]) -> bool {
    if units.len() < 3 {
        return false;
    }
    let drive = units[0];
    let is_letter = (u16::from(b'a') <= drive && drive <= u16::from(b'z'))
        || (u16::from(b'A') <= drive && drive <= u16::from(b'Z'));
    is_letter && units[1] == u16::from(b':') && units[2] == SEP
}

fn is_absolute_unc_path(units: &[u16]) -> bool {
    units.len() >= 3 && units[0] == SEP && units[1] == SEP
}

fn is_long_path(units: &[u16]) -> bool {
    units.starts_with(LONG_PATH_PREFIX)
}

fn is_unc_long_path(units: &[u16]) -> bool {
    units.starts_with(UNC_LONG_PATH_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(total_len: usize) -> String {
        format!("C:\\{}", "a".repeat(total_len - 3))
    }

    fn unc(total_len: usize) -> String {
        format!("\\\\server\\{}", "a".repeat(total_len - 9))
    }

    #[test]
    fn short_paths_are_left_alone() {
        let path = local(240);
        assert_eq!(to_long_path(&utf8_to_utf16(&path)), utf8_to_utf16(&path));
        assert_eq!(
            to_long_path(&utf8_to_utf16("C:\\data")),
            utf8_to_utf16("C:\\data")
        );
    }

    #[test]
    fn long_local_path_is_prefixed() {
        let path = local(241);
        let converted = to_long_path(&utf8_to_utf16(&path));
        assert_eq!(converted, utf8_to_utf16(&format!("\\\\?\\{path}")));
    }

    #[test]
    fn long_unc_path_is_prefixed() {
        let path = unc(241);
        let converted = to_long_path(&utf8_to_utf16(&path));
        let expected = format!("\\\\?\\UNC\\{}", &path[2..]);
        assert_eq!(converted, utf8_to_utf16(&expected));
    }

    #[test]
    fn already_long_path_is_unchanged() {
        let path = format!("\\\\?\\{}", local(250));
        assert_eq!(to_long_path(&utf8_to_utf16(&path)), utf8_to_utf16(&path));
    }

    #[test]
    fn unknown_format_is_unchanged() {
        let path = "a".repeat(300);
        assert_eq!(to_long_path(&utf8_to_utf16(&path)), utf8_to_utf16(&path));
    }

    #[test]
    fn strip_restores_local_form() {
        let path = local(241);
        let round_trip = strip_long_path(&to_long_path(&utf8_to_utf16(&path)));
        assert_eq!(round_trip, utf8_to_utf16(&path));
    }

    #[test]
    fn strip_restores_unc_form() {
        let path = unc(241);
        let round_trip = strip_long_path(&to_long_path(&utf8_to_utf16(&path)));
        assert_eq!(round_trip, utf8_to_utf16(&path));
    }

    #[test]
    fn strip_leaves_plain_paths_alone() {
        let path = utf8_to_utf16("C:\\data\\file.txt");
        assert_eq!(strip_long_path(&path), path);
    }

    #[test]
    fn utf_conversions_round_trip() {
        let path = "C:\\данные\\файл.txt";
        assert_eq!(utf16_to_utf8(&utf8_to_utf16(path)), path);
    }
}
