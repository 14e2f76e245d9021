//! Tagged encoding for arbitrary-precision integers in job payloads.
//!
//! Job payloads are stored as JSON and resumed by whichever worker picks them
//! up next, possibly after a restart or a deploy. JSON numbers lose precision
//! past 2^53, so every `U256` that crosses a job boundary is written as an
//! explicit tagged object instead:
//!
//! ```json
//! {"type": "BigInt", "hex": "0x2540be400"}
//! ```
//!
//! Use `#[serde(with = "crate::wire::big_int")]` on `U256` fields and
//! `#[serde(with = "crate::wire::big_int::option")]` on `Option<U256>`.

pub(crate) mod big_int {
    use alloy::primitives::U256;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    const TAG: &str = "BigInt";

    #[derive(Serialize, Deserialize)]
    struct Tagged {
        #[serde(rename = "type")]
        kind: String,
        hex: String,
    }

    fn encode(value: &U256) -> Tagged {
        Tagged {
            kind: TAG.to_string(),
            hex: format!("{value:#x}"),
        }
    }

    fn decode<E: serde::de::Error>(tagged: Tagged) -> Result<U256, E> {
        if tagged.kind != TAG {
            return Err(E::custom(format!(
                "expected tagged type {TAG}, got {}",
                tagged.kind
            )));
        }

        let digits = tagged
            .hex
            .strip_prefix("0x")
            .ok_or_else(|| E::custom(format!("BigInt hex must be 0x-prefixed: {}", tagged.hex)))?;

        U256::from_str_radix(digits, 16).map_err(E::custom)
    }

    pub(crate) fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        encode(value).serialize(serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        decode(Tagged::deserialize(deserializer)?)
    }

    pub(crate) mod option {
        use super::*;

        pub(crate) fn serialize<S: Serializer>(
            value: &Option<U256>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            value.as_ref().map(encode).serialize(serializer)
        }

        pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<U256>, D::Error> {
            Option::<Tagged>::deserialize(deserializer)?
                .map(decode)
                .transpose()
        }
    }

}
