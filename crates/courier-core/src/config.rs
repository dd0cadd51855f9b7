/// Trait for loading service configuration from environment variables.
///
/// Implementors derive `serde::Deserialize` (using `#[serde(default = ...)]`
/// for optional settings) and call `Config::from_env()` at startup.
/// Field `relay_port` is read from `RELAY_PORT`, and so on.
pub trait Config: Sized + serde::de::DeserializeOwned {
    /// Load from the process environment, reporting the first missing or
    /// malformed variable.
    fn try_from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    /// Load from an explicit list of `(NAME, value)` pairs.
    fn from_pairs<I>(pairs: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::from_iter(pairs)
    }

    /// # Panics
    ///
    /// Panics if any required env var is missing or cannot be deserialized.
    fn from_env() -> Self {
        match Self::try_from_env() {
            Ok(config) => config,
            Err(e) => panic!("failed to load config from environment: {e}"),
        }
    }
}
