// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Payload normalization
//
// Every bus payload is stored as a JSON object so the payload column has a
// uniform shape:
// - JSON objects are stored as-is
// - any other JSON value is wrapped as {"value": ...}
// - non UTF-8 text, text containing NUL, or non-JSON text is stored as
//   {"_raw_b64": ..., "_encoding": "base64"}

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine;
use serde_json::Value as JsonValue;

use crate::protocol::Payload;

pub const RAW_FIELD: &str = "_raw_b64";
pub const ENCODING_FIELD: &str = "_encoding";
pub const WRAPPED_FIELD: &str = "value";

/// Classification of a raw payload
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadClass<'a> {
    /// Top-level JSON object
    Structured(Payload),
    /// Any other JSON value (scalar, array or null)
    Scalar(JsonValue),
    /// Bytes that cannot be stored as JSON text
    Binary(&'a [u8]),
}

/// Classify a raw payload into exactly one of structured, scalar or binary
pub fn classify(raw: &[u8]) -> PayloadClass<'_> {
    let Ok(text) = std::str::from_utf8(raw) else {
        return PayloadClass::Binary(raw);
    };
    if text.contains('\0') {
        return PayloadClass::Binary(raw);
    }
    match serde_json::from_str::<JsonValue>(text) {
        Ok(JsonValue::Object(map)) => PayloadClass::Structured(map),
        Ok(other) => PayloadClass::Scalar(other),
        Err(_) => PayloadClass::Binary(raw),
    }
}

/// Convert a raw payload into a storage-safe JSON object
pub fn normalize(raw: &[u8]) -> Payload {
    match classify(raw) {
        PayloadClass::Structured(map) => map,
        PayloadClass::Scalar(value) => {
            let mut map = Payload::new();
            map.insert(WRAPPED_FIELD.to_string(), value);
            map
        }
        PayloadClass::Binary(bytes) => binary_envelope(bytes),
    }
}

fn binary_envelope(bytes: &[u8]) -> Payload {
    let mut map = Payload::new();
    map.insert(
        RAW_FIELD.to_string(),
        JsonValue::String(BASE64_ENGINE.encode(bytes)),
    );
    map.insert(
        ENCODING_FIELD.to_string(),
        JsonValue::String("base64".to_string()),
    );
    map
}

/// Original bytes of a binary envelope, if `payload` is one
pub fn raw_bytes(payload: &Payload) -> Option<Vec<u8>> {
    if payload.len() != 2 || payload.get(ENCODING_FIELD)?.as_str()? != "base64" {
        return None;
    }
    let encoded = payload.get(RAW_FIELD)?.as_str()?;
    BASE64_ENGINE.decode(encoded).ok()
}
