//! Hints for a failed boot, pulled from the capture.
//!
//! Verification itself only looks at markers. These patterns just make the
//! failure message say *why* the guest never reached a login prompt.

/// Console lines that mean the boot is not going to finish.
pub const BOOT_ERROR_PATTERNS: &[&str] = &[
    // firmware / bootloader
    "No bootable device",
    "Boot Failed",
    "ASSERT_EFI_ERROR",
    "Shell>",
    "error: no such partition",
    "error: file not found",
    // kernel
    "Kernel panic",
    "not syncing",
    "VFS: Cannot open root device",
    "No init found",
    "Attempted to kill init",
    // init
    "emergency shell",
    "Emergency shell",
    "emergency.target",
    "Timed out waiting for device",
    "Dependency failed",
    "Segmentation fault",
];

const MAX_HINTS: usize = 3;

/// First few console lines matching a known boot error, ANSI-stripped.
pub fn boot_error_hints(capture: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(capture);
    let mut hints: Vec<String> = Vec::new();
    for line in text.split(['\n', '\r']) {
        let clean = strip_ansi(line);
        let clean = clean.trim();
        if clean.is_empty() || hints.iter().any(|h| h == clean) {
            continue;
        }
        if BOOT_ERROR_PATTERNS.iter().any(|p| clean.contains(p)) {
            hints.push(clean.to_string());
            if hints.len() == MAX_HINTS {
                break;
            }
        }
    }
    hints
}

/// Drop escape sequences and stray control bytes from one console line.
pub fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.peek() {
                // CSI: parameters then a final byte in @..~
                Some('[') => {
                    chars.next();
                    for next in chars.by_ref() {
                        if ('@'..='~').contains(&next) {
                            break;
                        }
                    }
                }
                // OSC: until BEL or ESC \
                Some(']') => {
                    chars.next();
                    while let Some(next) = chars.next() {
                        if next == '\x07' {
                            break;
                        }
                        if next == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some('(') | Some(')') => {
                    chars.next();
                    chars.next();
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            },
            '\t' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}
