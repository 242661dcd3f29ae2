//! Static model catalog.
//!
//! Maps a model identifier to its modality, static output dimensionality,
//! description and loading strategy. The strategy is chosen per entry: model
//! families expose incompatible on-disk layouts and only the entry knows which
//! one applies.

use std::collections::HashMap;

use embeddings_types::ModelType;

/// How the loader should materialize a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    /// Direct sentence encoder, with a tokenizer + mean-pool fallback for text
    Standard,
    /// Dual text/image encoder in open_clip layout, addressed as `hf-hub:<id>`
    OpenClip,
    /// Joint model driven through a processor (transformers layout)
    JointProcessor,
}

/// One catalog row.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub id: String,
    pub modality: ModelType,
    /// Static dimensionality; the loaded handle may report a probed value.
    pub dimensions: usize,
    pub description: String,
    pub strategy: LoadStrategy,
}

impl CatalogEntry {
    pub fn new(
        id: impl Into<String>,
        modality: ModelType,
        dimensions: usize,
        description: impl Into<String>,
        strategy: LoadStrategy,
    ) -> Self {
        Self {
            id: id.into(),
            modality,
            dimensions,
            description: description.into(),
            strategy,
        }
    }
}

/// Read-only lookup table of known models.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    entries: HashMap<String, CatalogEntry>,
    /// Identifiers in declaration order, for listing.
    order: Vec<String>,
}

impl ModelCatalog {
    /// Build a catalog from explicit entries. Later duplicates replace earlier ones.
    pub fn new(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        let mut map = HashMap::new();
        let mut order = Vec::new();
        for entry in entries {
            if !map.contains_key(&entry.id) {
                order.push(entry.id.clone());
            }
            map.insert(entry.id.clone(), entry);
        }
        Self {
            entries: map,
            order,
        }
    }

    /// The models this service ships with.
    pub fn builtin() -> Self {
        use LoadStrategy::*;
        use ModelType::*;

        Self::new([
            CatalogEntry::new(
                "sentence-transformers/all-MiniLM-L6-v2",
                Text,
                768,
                "Fast and efficient text embedding model",
                Standard,
            ),
            CatalogEntry::new(
                "sentence-transformers/all-mpnet-base-v2",
                Text,
                768,
                "High-quality text embedding model",
                Standard,
            ),
            CatalogEntry::new(
                "sentence-transformers/paraphrase-multilingual-MiniLM-L12-v2",
                Text,
                768,
                "Multilingual text embedding model",
                Standard,
            ),
            CatalogEntry::new(
                "openai/clip-vit-base-patch32",
                Multimodal,
                512,
                "CLIP model for text and image embeddings",
                Standard,
            ),
            CatalogEntry::new(
                "sentence-transformers/clip-ViT-B-32",
                Multimodal,
                512,
                "Sentence-transformers CLIP model",
                Standard,
            ),
            CatalogEntry::new(
                "Marqo/marqo-ecommerce-embeddings-B",
                Multimodal,
                768,
                "Marqo ecommerce embedding model",
                OpenClip,
            ),
            CatalogEntry::new(
                "Marqo/marqo-ecommerce-embeddings-L",
                Multimodal,
                1024,
                "Marqo ecommerce embedding model (large)",
                OpenClip,
            ),
            CatalogEntry::new(
                "openai/clip-vit-large-patch14",
                Multimodal,
                768,
                "CLIP ViT-L/14 joint model driven through its processor",
                JointProcessor,
            ),
        ])
    }

    /// Look up an entry.
    pub fn entry(&self, id: &str) -> Option<&CatalogEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Modality of `id`, defaulting to TEXT for unknown identifiers.
    ///
    /// This is a convenience default for callers that only need a modality
    /// hint; loading an unknown identifier still fails.
    pub fn get_model_type(&self, id: &str) -> ModelType {
        self.entry(id).map(|e| e.modality).unwrap_or(ModelType::Text)
    }

    /// Entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
