//! Positional call arguments.
//!
//! Arguments come from two places: path segments after the operation name
//! (each JSON-decoded, falling back to the raw string) followed by the
//! request body. An array body contributes its elements positionally; any
//! other non-empty body is a single argument.

use percent_encoding::percent_decode_str;
use serde::de::DeserializeOwned;
use tether_core::codec;
use tether_core::{RichValue, RpcError};

/// Ordered arguments of one call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Args {
    values: Vec<RichValue>,
}

impl Args {
    /// Wrap decoded values.
    pub fn new(values: Vec<RichValue>) -> Self {
        Self { values }
    }

    /// Argument count.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no arguments were passed.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw argument at `index`.
    pub fn raw(&self, index: usize) -> Option<&RichValue> {
        self.values.get(index)
    }

    /// Typed argument at `index`. Missing or mistyped arguments are a 400.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, RpcError> {
        let value = self
            .values
            .get(index)
            .cloned()
            .ok_or_else(|| RpcError::bad_request(format!("Missing argument {index}")))?;
        value
            .deserialize_into()
            .map_err(|e| RpcError::bad_request(format!("Argument {index}: {e}")))
    }

    /// Typed optional argument; absent or `null` gives `None`.
    pub fn opt<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, RpcError> {
        match self.values.get(index) {
            None | Some(RichValue::Null) => Ok(None),
            Some(_) => self.get(index).map(Some),
        }
    }

    /// Require exactly `expected` arguments.
    pub fn expect_len(&self, expected: usize) -> Result<(), RpcError> {
        if self.values.len() == expected {
            Ok(())
        } else {
            Err(RpcError::bad_request(format!(
                "Expected {expected} argument(s), got {}",
                self.values.len()
            )))
        }
    }

    /// Consume into the underlying values.
    pub fn into_vec(self) -> Vec<RichValue> {
        self.values
    }
}

impl From<Vec<RichValue>> for Args {
    fn from(values: Vec<RichValue>) -> Self {
        Self::new(values)
    }
}

/// Decode one path segment: JSON if it parses, the raw text otherwise.
pub fn decode_segment(raw: &str) -> RichValue {
    let text = percent_decode_str(raw).decode_utf8_lossy();
    codec::decode(&text).unwrap_or_else(|_| RichValue::String(text.into_owned()))
}

/// Build call arguments from path segments and the request body.
pub fn collect(path_args: &[String], body: &[u8]) -> Result<Args, RpcError> {
    let mut values: Vec<RichValue> = path_args.iter().map(|s| decode_segment(s)).collect();

    if !body.iter().all(u8::is_ascii_whitespace) {
        let decoded = codec::decode_slice(body)
            .map_err(|e| RpcError::bad_request(format!("Malformed request body: {e}")))?;
        match decoded {
            RichValue::Array(items) => values.extend(items),
            other => values.push(other),
        }
    }

    Ok(Args::new(values))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde::Deserialize;

    use super::*;

    fn segs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn path_segments_decode_as_json_or_text() {
        let args = collect(&segs(&["123", "true", "alice", "%22quoted%22"]), b"").unwrap();
        assert_eq!(args.get::<i64>(0).unwrap(), 123);
        assert!(args.get::<bool>(1).unwrap());
        assert_eq!(args.get::<String>(2).unwrap(), "alice");
        assert_eq!(args.get::<String>(3).unwrap(), "quoted");
    }

    #[test]
    fn array_body_spreads_positionally() {
        let args = collect(&segs(&["7"]), br#"["a", {"b": 1}]"#).unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args.get::<i64>(0).unwrap(), 7);
        assert_eq!(args.get::<String>(1).unwrap(), "a");
    }

    #[test]
    fn object_body_is_one_argument() {
        #[derive(Deserialize)]
        struct Filter {
            active: bool,
        }
        let args = collect(&[], br#"{"active": true}"#).unwrap();
        assert_eq!(args.len(), 1);
        assert!(args.get::<Filter>(0).unwrap().active);
    }

    #[test]
    fn empty_body_adds_nothing() {
        assert!(collect(&[], b"").unwrap().is_empty());
        assert!(collect(&[], b"  \n").unwrap().is_empty());
    }

    #[test]
    fn rich_body_values_survive() {
        let args = collect(&[], br#"[{"$bytes": "AQI="}]"#).unwrap();
        assert_eq!(args.raw(0).unwrap().as_bytes().unwrap().as_ref(), &[1, 2]);
    }

    #[test]
    fn malformed_body_is_bad_request() {
        assert_matches!(collect(&[], b"{nope"), Err(RpcError::BadRequest { .. }));
    }

    #[test]
    fn typed_access_errors_are_bad_requests() {
        let args = Args::new(vec!["x".into()]);
        assert_matches!(args.get::<i64>(0), Err(RpcError::BadRequest { .. }));
        assert_matches!(args.get::<String>(1), Err(RpcError::BadRequest { .. }));
        assert!(args.expect_len(1).is_ok());
        assert_matches!(args.expect_len(2), Err(RpcError::BadRequest { .. }));
    }

    #[test]
    fn optional_arguments() {
        let args = Args::new(vec![RichValue::Null, 5_i64.into()]);
        assert_eq!(args.opt::<i64>(0).unwrap(), None);
        assert_eq!(args.opt::<i64>(1).unwrap(), Some(5));
        assert_eq!(args.opt::<i64>(2).unwrap(), None);
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn arbitrary_segments_never_fail(seg in "[a-zA-Z0-9%._~-]{0,24}") {
                let args = collect(&[seg], b"").unwrap();
                prop_assert_eq!(args.len(), 1);
            }
        }
    }
}
