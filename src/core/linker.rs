//! Bytecode linking: substitute library addresses for placeholders.
//!
//! A placeholder is exactly as wide as a hex address (40 characters), so
//! linking never shifts offsets inside the image. Two forms are recognised:
//!
//! - hashed: `__$` + first 34 hex chars of SHA-256(artifact id) + `$__`
//! - legacy: `__` + artifact id (truncated to 36 chars, `_`-padded) + `__`
//!
//! Hex text never contains `_` or `$`, so anything left over after
//! substitution is an unresolved placeholder.

use crate::core::address::Address;
use crate::core::artifact::{ArtifactId, Template};
use crate::core::error::KeystoneError;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::LazyLock;

const HASH_CHARS: usize = 34;
const LEGACY_NAME_CHARS: usize = 36;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"__(\$[0-9a-fA-F]{34}\$|[^$]{36})__").expect("placeholder pattern is valid")
});

/// Hashed placeholder for `id`.
pub fn placeholder(id: &ArtifactId) -> String {
    let digest = hex::encode(Sha256::digest(id.as_str().as_bytes()));
    format!("__${}$__", &digest[..HASH_CHARS])
}

/// Legacy name-based placeholder for `id`.
pub fn legacy_placeholder(id: &ArtifactId) -> String {
    let truncated: String = id.as_str().chars().take(LEGACY_NAME_CHARS).collect();
    format!("__{:_<width$}__", truncated, width = LEGACY_NAME_CHARS)
}

/// Placeholders still present in `text`, in order of appearance.
pub fn find_placeholders(text: &str) -> Vec<String> {
    PLACEHOLDER
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Describe an unresolved placeholder, naming the artifact when the legacy
/// form gives it away.
fn describe(placeholder: &str) -> String {
    let inner = &placeholder[2..placeholder.len() - 2];
    if inner.starts_with('$') {
        placeholder.to_string()
    } else {
        format!("{} ({})", placeholder, inner.trim_end_matches('_'))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Linker;

impl Linker {
    pub fn new() -> Self {
        Linker
    }

    /// Produce a deployable image from `template` and the addresses of its
    /// link dependencies.
    ///
    /// Pure: the same inputs always give the same bytes.
    pub fn link(
        &self,
        template: &Template,
        resolved: &BTreeMap<ArtifactId, Address>,
    ) -> Result<Vec<u8>, KeystoneError> {
        let mut text = template.as_str().to_string();
        let mut labels: BTreeMap<String, (&ArtifactId, &Address)> = BTreeMap::new();
        for (id, address) in resolved {
            for label in [placeholder(id), legacy_placeholder(id)] {
                if !text.contains(&label) {
                    continue;
                }
                if let Some((first, _)) = labels.get(&label) {
                    return Err(KeystoneError::AmbiguousPlaceholder {
                        placeholder: label,
                        first: (*first).clone(),
                        second: id.clone(),
                    });
                }
                labels.insert(label, (id, address));
            }
        }
        for (label, (_, address)) in &labels {
            text = text.replace(label, &address.to_hex());
        }

        if let Some(left) = find_placeholders(&text).first() {
            return Err(KeystoneError::UnresolvedPlaceholder {
                placeholder: describe(left),
            });
        }
        if text.contains(['_', '$']) {
            return Err(KeystoneError::InvalidTemplate(
                "malformed link placeholder".to_string(),
            ));
        }
        if text.len() % 2 != 0 {
            return Err(KeystoneError::InvalidTemplate(format!(
                "odd number of hex characters ({})",
                text.len()
            )));
        }
        hex::decode(&text).map_err(|e| KeystoneError::InvalidTemplate(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address::from_bytes(&[b; 20]).unwrap()
    }

    #[test]
    fn test_placeholders_are_address_width() {
        let id = ArtifactId::from("commons-base/ErrorsLib.sol:ErrorsLib");
        assert_eq!(placeholder(&id).len(), Address::HEX_LEN);
        assert_eq!(legacy_placeholder(&id).len(), Address::HEX_LEN);
        assert_eq!(
            legacy_placeholder(&ArtifactId::from("ErrorsLib")),
            format!("__ErrorsLib{}__", "_".repeat(27))
        );
    }

    #[test]
    fn test_links_repeated_placeholder() {
        let lib = ArtifactId::from("L");
        let ph = placeholder(&lib);
        let template = Template::new(format!("60{}61{}62", ph, ph));
        let mut resolved = BTreeMap::new();
        resolved.insert(lib, addr(0xAA));

        let bytes = Linker::new().link(&template, &resolved).unwrap();
        assert_eq!(bytes.len(), 3 + 2 * Address::LEN);
        assert_eq!(&bytes[1..21], &[0xAA; 20]);
        assert_eq!(&bytes[22..42], &[0xAA; 20]);
    }

    #[test]
    fn test_links_legacy_placeholder() {
        let lib = ArtifactId::from("Strings");
        let template = Template::new(format!("00{}", legacy_placeholder(&lib)));
        let mut resolved = BTreeMap::new();
        resolved.insert(lib, addr(0x01));
        let bytes = Linker::new().link(&template, &resolved).unwrap();
        assert_eq!(&bytes[1..], &[0x01; 20]);
    }

    #[test]
    fn test_unresolved_placeholder_is_rejected() {
        let template = Template::new(format!("60{}", placeholder(&ArtifactId::from("Missing"))));
        let err = Linker::new().link(&template, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, KeystoneError::UnresolvedPlaceholder { .. }));
    }

    #[test]
    fn test_unresolved_legacy_names_the_artifact() {
        let template = Template::new(legacy_placeholder(&ArtifactId::from("MappingsLib")));
        match Linker::new().link(&template, &BTreeMap::new()) {
            Err(KeystoneError::UnresolvedPlaceholder { placeholder }) => {
                assert!(placeholder.ends_with("(MappingsLib)"))
            }
            other => panic!("expected unresolved placeholder, got {:?}", other),
        }
    }

    #[test]
    fn test_resolution_order_does_not_matter() {
        let a = ArtifactId::from("A");
        let b = ArtifactId::from("B");
        let template = Template::new(format!("{}ff{}", placeholder(&b), placeholder(&a)));

        let mut first = BTreeMap::new();
        first.insert(a.clone(), addr(1));
        first.insert(b.clone(), addr(2));
        let mut second = BTreeMap::new();
        second.insert(b, addr(2));
        second.insert(a, addr(1));

        let linker = Linker::new();
        assert_eq!(
            linker.link(&template, &first).unwrap(),
            linker.link(&template, &second).unwrap()
        );
    }

    #[test]
    fn test_colliding_legacy_labels_are_ambiguous() {
        let short = ArtifactId::from("L");
        let padded = ArtifactId::from("L_");
        assert_eq!(legacy_placeholder(&short), legacy_placeholder(&padded));

        let template = Template::new(format!("60{}", legacy_placeholder(&padded)));
        let mut resolved = BTreeMap::new();
        resolved.insert(short, addr(0x11));
        resolved.insert(padded, addr(0x22));
        match Linker::new().link(&template, &resolved) {
            Err(KeystoneError::AmbiguousPlaceholder { first, second, .. }) => {
                assert_eq!(first.as_str(), "L");
                assert_eq!(second.as_str(), "L_");
            }
            other => panic!("expected an ambiguous placeholder, got {:?}", other),
        }

        // Only one of them present in the map: no ambiguity.
        let mut single = BTreeMap::new();
        single.insert(ArtifactId::from("L_"), addr(0x22));
        assert_eq!(
            Linker::new().link(&template, &single).unwrap()[1..],
            [0x22; 20]
        );
    }

    #[test]
    fn test_rejects_bad_hex() {
        let err = Linker::new()
            .link(&Template::new("60z0"), &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, KeystoneError::InvalidTemplate(_)));
        let err = Linker::new()
            .link(&Template::new("608"), &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, KeystoneError::InvalidTemplate(_)));
    }

    #[test]
    fn test_extra_resolved_entries_are_ignored() {
        let mut resolved = BTreeMap::new();
        resolved.insert(ArtifactId::from("Unused"), addr(9));
        assert_eq!(
            Linker::new().link(&Template::new("6080"), &resolved).unwrap(),
            vec![0x60, 0x80]
        );
    }
}
