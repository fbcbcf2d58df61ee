/// Bucket a cache generation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationKind {
  /// Application shell, pre-warmed at install
  Shell,
  /// Content-hashed build assets
  Immutable,
  /// Everything cached at runtime
  Dynamic,
}

impl GenerationKind {
  pub const ALL: [GenerationKind; 3] = [
    GenerationKind::Shell,
    GenerationKind::Immutable,
    GenerationKind::Dynamic,
  ];

  pub fn prefix(self) -> &'static str {
    match self {
      GenerationKind::Shell => "shell",
      GenerationKind::Immutable => "immutable",
      GenerationKind::Dynamic => "dynamic",
    }
  }
}

/// Generation names for one build version.
///
/// A new deployment gets new names, so it never reads a generation
/// written by an older build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
  version: String,
}

impl CacheNames {
  pub fn new(version: impl Into<String>) -> Self {
    Self {
      version: version.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn name(&self, kind: GenerationKind) -> String {
    format!("{}-{}", kind.prefix(), self.version)
  }

  /// The three names expected to exist once this version is active.
  pub fn current(&self) -> Vec<String> {
    GenerationKind::ALL.iter().map(|k| self.name(*k)).collect()
  }

  pub fn is_current(&self, name: &str) -> bool {
    GenerationKind::ALL.iter().any(|k| self.name(*k) == name)
  }
}
