//! Flasher stub blobs and their process-wide cache
//!
//! A stub is a position-specific RAM program uploaded to the target before
//! flashing; it is faster than the ROM loader and understands extra
//! commands. Blobs are distributed as JSON files keyed by chip name and are
//! retrieved through a caller-supplied [`StubProvider`] (typically an HTTP
//! fetch), then cached for the lifetime of the process.

use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
};

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use super::targets::Chip;
use crate::error::Error;

/// Handshake the stub prints once it is running
pub(crate) const EXPECTED_STUB_HANDSHAKE: &str = "OHAI";

/// Retrieves stub blob files by file name
///
/// Implementations typically fetch `<base-url>/<file-name>` over HTTP; the
/// library never performs network I/O itself.
pub trait StubProvider {
    /// Fetch the raw JSON bytes of the named stub file, trying the given
    /// candidate names in order
    fn fetch(&self, file_names: &[String]) -> Result<Vec<u8>, Error>;
}

/// Flash stub object (deserialized from the JSON files shipped next to
/// `esptool.py`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashStub {
    /// Entry point (address)
    entry: u32,
    /// Text (base64 encoded)
    text: String,
    /// Start of text section address
    text_start: u32,
    /// Data (base64 encoded)
    data: String,
    /// Start of data section address
    data_start: u32,
}

impl FlashStub {
    /// Parse a stub blob from its JSON representation
    pub fn from_json(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::EspStubFailed(format!("invalid stub blob: {e}")))
    }

    /// Fetch stub entry point
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Fetch text start address and bytes
    pub fn text(&self) -> Result<(u32, Vec<u8>), Error> {
        let v = general_purpose::STANDARD
            .decode(&self.text)
            .map_err(|e| Error::EspStubFailed(format!("invalid stub text encoding: {e}")))?;
        Ok((self.text_start, v))
    }

    /// Fetch data start address and bytes
    pub fn data(&self) -> Result<(u32, Vec<u8>), Error> {
        let v = general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| Error::EspStubFailed(format!("invalid stub data encoding: {e}")))?;
        Ok((self.data_start, v))
    }
}

/// Normalize a chip name to its stub cache key (`"ESP32-S2"` -> `"esp32s2"`)
pub fn stub_key(chip_name: &str) -> String {
    chip_name.to_lowercase().replace('-', "")
}

/// File names a provider should try for a cache key, in order
pub fn stub_file_names(key: &str) -> [String; 2] {
    [format!("{key}.json"), format!("stub_flasher_{key}.json")]
}

fn cache() -> &'static Mutex<HashMap<String, FlashStub>> {
    static CACHE: OnceLock<Mutex<HashMap<String, FlashStub>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Fetch the stub for `chip`, consulting the process-wide cache first
pub fn get_stub(chip: Chip, provider: &dyn StubProvider) -> Result<FlashStub, Error> {
    let key = stub_key(&chip.to_string());

    if let Some(stub) = cache().lock().unwrap().get(&key) {
        return Ok(stub.clone());
    }

    let bytes = provider.fetch(&stub_file_names(&key))?;
    let stub = FlashStub::from_json(&bytes)?;

    cache()
        .lock()
        .unwrap()
        .entry(key)
        .or_insert_with(|| stub.clone());

    Ok(stub)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    pub(crate) const TINY_STUB: &str = r#"{
        "entry": 1074521560,
        "text": "CAD0PxwA9D8AAPQ/",
        "text_start": 1074520064,
        "data": "BAPQPw==",
        "data_start": 1073605544
    }"#;

    #[test]
    fn chip_names_normalize() {
        assert_eq!(stub_key("ESP32-S2"), "esp32s2");
        assert_eq!(stub_key("esp8266"), "esp8266");
        assert_eq!(stub_key("ESP32-C3"), "esp32c3");
    }

    #[test]
    fn file_name_candidates() {
        assert_eq!(
            stub_file_names("esp32"),
            ["esp32.json".to_string(), "stub_flasher_esp32.json".to_string()]
        );
    }

    #[test]
    fn parses_blob_fields() {
        let stub = FlashStub::from_json(TINY_STUB.as_bytes()).unwrap();

        assert_eq!(stub.entry(), 1074521560);

        let (text_start, text) = stub.text().unwrap();
        assert_eq!(text_start, 1074520064);
        assert_eq!(text.len(), 12);

        let (data_start, data) = stub.data().unwrap();
        assert_eq!(data_start, 1073605544);
        assert_eq!(data, vec![0x04, 0x03, 0xD0, 0x3F]);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(FlashStub::from_json(b"{\"entry\": 1}").is_err());
    }

    #[test]
    fn cache_hits_skip_the_provider() {
        struct CountingProvider(std::cell::Cell<usize>);

        impl StubProvider for CountingProvider {
            fn fetch(&self, _file_names: &[String]) -> Result<Vec<u8>, Error> {
                self.0.set(self.0.get() + 1);
                Ok(TINY_STUB.as_bytes().to_vec())
            }
        }

        let provider = CountingProvider(std::cell::Cell::new(0));

        let a = get_stub(Chip::Esp32s3, &provider).unwrap();
        let b = get_stub(Chip::Esp32s3, &provider).unwrap();

        assert_eq!(a, b);
        assert_eq!(provider.0.get(), 1);
    }
}
