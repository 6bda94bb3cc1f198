//! Input checks run before anything is logged or written.

use crate::error::ValidationError;
use vecstore_core::config;
use vecstore_core::hnsw::validate_vector;
use vecstore_core::Document;

pub(crate) fn collection_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.chars().count() > config::MAX_COLLECTION_NAME_LEN {
        return Err(ValidationError::InvalidCollectionName(name.to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(ValidationError::InvalidCollectionName(name.to_string()));
    }
    Ok(())
}

pub(crate) fn dimensions(dims: usize) -> Result<(), ValidationError> {
    if dims == 0 || dims > config::MAX_DIMENSION {
        return Err(ValidationError::InvalidDimensions {
            actual: dims,
            max: config::MAX_DIMENSION,
        });
    }
    Ok(())
}

pub(crate) fn k(k: usize) -> Result<(), ValidationError> {
    if k == 0 || k > config::MAX_K {
        return Err(ValidationError::InvalidK {
            actual: k,
            max: config::MAX_K,
        });
    }
    Ok(())
}

pub(crate) fn document_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::EmptyId);
    }
    if id.len() > config::MAX_DOCUMENT_ID_LEN {
        return Err(ValidationError::TooLong {
            what: "document id",
            limit: config::MAX_DOCUMENT_ID_LEN,
        });
    }
    Ok(())
}

pub(crate) fn document(doc: &Document, dims: usize) -> Result<(), ValidationError> {
    document_id(&doc.id)?;
    validate_vector(&doc.vector, dims)?;
    if doc.metadata.len() > config::MAX_METADATA_KEYS {
        return Err(ValidationError::TooLong {
            what: "metadata key count",
            limit: config::MAX_METADATA_KEYS,
        });
    }
    if doc.text.as_ref().is_some_and(|t| t.len() > config::MAX_TEXT_LEN) {
        return Err(ValidationError::TooLong {
            what: "text",
            limit: config::MAX_TEXT_LEN,
        });
    }
    Ok(())
}

pub(crate) fn batch(docs: &[Document], dims: usize) -> Result<(), ValidationError> {
    if docs.len() > config::MAX_BATCH_SIZE {
        return Err(ValidationError::BatchTooLarge {
            actual: docs.len(),
            max: config::MAX_BATCH_SIZE,
        });
    }
    docs.iter().try_for_each(|doc| document(doc, dims))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vecstore_core::VectorError;

    #[test]
    fn test_collection_names() {
        assert!(collection_name("docs_v2-en").is_ok());
        assert!(collection_name("").is_err());
        assert!(collection_name("a b").is_err());
        assert!(collection_name(&"x".repeat(config::MAX_COLLECTION_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_document_checks() {
        assert!(document(&Document::new("a", vec![1.0, 0.0]), 2).is_ok());
        assert!(matches!(
            document(&Document::new("", vec![1.0, 0.0]), 2),
            Err(ValidationError::EmptyId)
        ));
        assert!(matches!(
            document(&Document::new("a", vec![1.0]), 2),
            Err(ValidationError::Vector(VectorError::DimensionMismatch { expected: 2, actual: 1 }))
        ));
        assert!(matches!(
            document(&Document::new("a", vec![f32::NAN, 0.0]), 2),
            Err(ValidationError::Vector(VectorError::NonFinite))
        ));
    }

    #[test]
    fn test_k_bounds() {
        assert!(k(1).is_ok());
        assert!(k(0).is_err());
        assert!(k(config::MAX_K + 1).is_err());
    }
}
