use std::path::PathBuf;
use std::{env, fs};

const KEY_LEN: usize = 16;

/// Embed the archive key as `ENCRYPTION_KEY: [u8; 16]`. The key file must
/// hold exactly 16 bytes; one trailing newline is ignored.
fn embed_encryption_key() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let key_path = env::var_os("MUBAN_ENCRYPTION_KEY_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|| manifest_dir.join("ENCRYPTION_KEY"));

    println!("cargo:rerun-if-env-changed=MUBAN_ENCRYPTION_KEY_FILE");
    println!("cargo:rerun-if-changed={}", key_path.display());

    let raw = fs::read(&key_path)
        .unwrap_or_else(|e| panic!("cannot read encryption key {}: {}", key_path.display(), e));
    let key = raw
        .strip_suffix(b"\r\n")
        .or_else(|| raw.strip_suffix(b"\n"))
        .unwrap_or(&raw);
    if key.len() != KEY_LEN {
        panic!(
            "encryption key {} must be exactly {} bytes, got {}",
            key_path.display(),
            KEY_LEN,
            key.len()
        );
    }

    let out = PathBuf::from(env::var("OUT_DIR").unwrap()).join("encryption_key.rs");
    let code = format!(
        "/// Archive key, embedded at build time.\npub const ENCRYPTION_KEY: [u8; {}] = {:?};\n",
        KEY_LEN, key
    );
    fs::write(&out, code).unwrap_or_else(|e| panic!("cannot write {}: {}", out.display(), e));
}

fn main() {
    embed_encryption_key();
    tauri_build::build()
}
