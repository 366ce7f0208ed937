//! Outbound file validation.
//!
//! Uploads are checked once here: existence, regular file, size bound,
//! extension allow-list, and an executable-content sniff (ELF and PE
//! magic bytes). This is the single authority for outbound size checks;
//! inbound requests are sized by the policy gate instead.

use std::io::Read;
use std::path::Path;

use crate::config::{normalize_extension, EngineConfig};

const MIB: u64 = 1024 * 1024;

/// Validates a file for upload. Returns its size, or the rejection reason.
pub fn validate_file(path: &Path, config: &EngineConfig) -> Result<u64, String> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return Err("file does not exist".into()),
    };

    if !metadata.is_file() {
        return Err("path is not a file".into());
    }

    let size = metadata.len();
    if size > config.max_file_size {
        return Err(format!(
            "file size ({} MB) exceeds maximum allowed size ({} MB)",
            size / MIB,
            config.max_file_size / MIB
        ));
    }

    // Extensionless files pass; a present extension must be allow-listed.
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        let ext = normalize_extension(ext);
        if !config.allowed_extensions.contains(&ext) {
            return Err(format!("file extension '{ext}' is not allowed"));
        }
    }

    if is_executable_content(path) {
        return Err("executable files are not allowed".into());
    }

    Ok(size)
}

/// Sniffs ELF (`\x7fELF`) and PE (`MZ`) magic bytes.
fn is_executable_content(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let Ok(n) = file.read(&mut magic) else {
        return false;
    };
    (n >= 4 && magic == [0x7f, b'E', b'L', b'F']) || (n >= 2 && magic[..2] == *b"MZ")
}
