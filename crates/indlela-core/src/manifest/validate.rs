//! Manifest parsing and invariant validation.

use tracing::debug;

use crate::error::{Error, Result};
use crate::manifest::model::Manifest;

/// Context lengths the downgrade ladder understands.
pub const CONTEXT_LADDER: [u32; 3] = [8192, 4096, 2048];

/// Parse a manifest from JSON and validate its invariants.
///
/// Invariant violations are the only errors allowed to abort startup, so
/// everything is checked here, at ingress.
pub fn parse(json: &str) -> Result<Manifest> {
    let manifest: Manifest = serde_json::from_str(json)
        .map_err(|e| Error::InvalidModelFormat(format!("manifest does not parse: {e}")))?;
    validate(&manifest)?;
    debug!(
        models = manifest.models.len(),
        content_version = %manifest.content_version,
        "manifest parsed"
    );
    Ok(manifest)
}

/// Check invariants on an already-deserialized manifest.
pub fn validate(manifest: &Manifest) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for item in &manifest.models {
        // Ids unique per manifest.
        if !seen.insert(item.id.as_str()) {
            return Err(Error::InvalidModelFormat(format!(
                "duplicate model id '{}'",
                item.id
            )));
        }

        if item.required_artifacts.is_empty() {
            return Err(Error::InvalidModelFormat(format!(
                "model '{}' has no required artifacts",
                item.id
            )));
        }

        // Every required artifact carries a well-formed digest.
        for artifact in &item.required_artifacts {
            if !is_sha256_hex(&artifact.sha256) {
                return Err(Error::InvalidModelFormat(format!(
                    "model '{}' artifact '{}' has malformed sha256 '{}'",
                    item.id, artifact.name, artifact.sha256
                )));
            }
            if artifact.path.is_empty() || artifact.path.starts_with('/') {
                return Err(Error::InvalidModelFormat(format!(
                    "model '{}' artifact '{}' has invalid path '{}'",
                    item.id, artifact.name, artifact.path
                )));
            }
        }

        // Context length must sit on the downgrade ladder.
        if let Some(ctx) = item.context_length {
            if !CONTEXT_LADDER.contains(&ctx) {
                return Err(Error::InvalidModelFormat(format!(
                    "model '{}' contextLength {} is not one of {:?}",
                    item.id, ctx, CONTEXT_LADDER
                )));
            }
        }

        // The declared quantization must head its own variants list when
        // one is present, otherwise the downgrade walk has no anchor.
        if !item.quantization_variants.is_empty() {
            match &item.quantization {
                Some(q) if item.quantization_variants.contains(q) => {}
                _ => {
                    return Err(Error::InvalidModelFormat(format!(
                        "model '{}' quantization is not listed in its variants",
                        item.id
                    )));
                }
            }
        }
    }
    Ok(())
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_json(models: &str) -> String {
        format!(
            r#"{{
                "schemaVersion": 1,
                "contentVersion": "2026-07-01",
                "generatedAt": "2026-07-01T12:00:00Z",
                "models": [{models}]
            }}"#
        )
    }

    fn item_json(id: &str, sha: &str) -> String {
        format!(
            r#"{{
                "id": "{id}",
                "type": "llm",
                "version": "1.0.0",
                "backendHints": ["llama.cpp"],
                "platforms": ["linux", "macos"],
                "contextLength": 8192,
                "requiredArtifacts": [{{
                    "name": "model.gguf",
                    "role": "model",
                    "format": "gguf",
                    "path": "{id}/model.gguf",
                    "size": 1024,
                    "sha256": "{sha}"
                }}]
            }}"#
        )
    }

    #[test]
    fn test_parse_valid_manifest() {
        let json = manifest_json(&item_json("llama3.1-8b-q4km", &"ab".repeat(32)));
        let manifest = parse(&json).unwrap();
        assert_eq!(manifest.models.len(), 1);
        let item = manifest.get("llama3.1-8b-q4km").unwrap();
        assert_eq!(item.context_length, Some(8192));
        assert_eq!(item.version.to_string(), "1.0.0");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let json = manifest_json(&format!(
            "{},{}",
            item_json("m1", &"ab".repeat(32)),
            item_json("m1", &"cd".repeat(32))
        ));
        let err = parse(&json).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidModelFormat);
    }

    #[test]
    fn test_malformed_sha_rejected() {
        let json = manifest_json(&item_json("m1", "DEADBEEF"));
        assert!(parse(&json).is_err());
    }

    #[test]
    fn test_off_ladder_context_rejected() {
        let json = manifest_json(&item_json("m1", &"ab".repeat(32))).replace("8192", "6144");
        assert!(parse(&json).is_err());
    }

    #[test]
    fn test_unknown_backend_hint_rejected() {
        let json = manifest_json(&item_json("m1", &"ab".repeat(32)))
            .replace("llama.cpp\"]", "llama.cpp\", \"exotron\"]");
        let err = parse(&json).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidModelFormat);
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let json = manifest_json(&item_json("m1", &"ab".repeat(32)))
            .replace("\"type\"", "\"vendorNote\": \"keep me\", \"type\"");
        let manifest = parse(&json).unwrap();
        let item = manifest.get("m1").unwrap();
        assert_eq!(
            item.extra.get("vendorNote").and_then(|v| v.as_str()),
            Some("keep me")
        );
        let out = serde_json::to_value(&manifest).unwrap();
        assert_eq!(
            out["models"][0]["vendorNote"],
            serde_json::Value::String("keep me".into())
        );
    }
}
