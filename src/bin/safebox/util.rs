use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};

use SafeBox::crypto::key_from_env;
use SafeBox::{SafeBoxBuilder, SafeBoxEngine};

/// Открыть движок с ключом из ENV; загрузка дожидается первого обращения.
pub fn open_engine(path: &Path, name: &str) -> Result<SafeBoxEngine> {
    let key = key_from_env()?;
    SafeBoxBuilder::new(path, name)
        .aes_key(key)
        .open()
        .with_context(|| format!("open safebox '{}' in {}", name, path.display()))
}

pub fn decode_value_arg(arg: &str) -> Result<(Vec<u8>, &'static str)> {
    if arg == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        return Ok((buf, "stdin"));
    }
    if let Some(p) = arg.strip_prefix('@') {
        let path = PathBuf::from(p);
        let buf = std::fs::read(&path)
            .map_err(|e| anyhow!("read value file {}: {}", path.display(), e))?;
        return Ok((buf, "file"));
    }
    if let Some(hx) = arg.strip_prefix("hex:") {
        return Ok((decode_hex(hx)?, "hex"));
    }
    Ok((arg.as_bytes().to_vec(), "literal"))
}

pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err(anyhow!("hex string must have even length"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| anyhow!("invalid hex at pos {}", i))
        })
        .collect()
}

pub fn display_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => format!("(binary {} B)", bytes.len()),
    }
}

pub fn hex_preview(bytes: &[u8]) -> String {
    let shown = &bytes[..bytes.len().min(32)];
    let mut out: String = shown.iter().map(|b| format!("{:02x}", b)).collect();
    if bytes.len() > shown.len() {
        out.push_str("..");
    }
    out
}
