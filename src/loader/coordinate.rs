//! Artifact coordinates and library version selection.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A group/name/version triple identifying one external artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coordinate {
    pub group: String,
    pub name: String,
    pub version: String,
}

impl Coordinate {
    pub fn new(
        group: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Coordinate {
            group: group.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.name, self.version)
    }
}

/// A pluggable library the backends may load from the resolved artifact set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LibrarySpec {
    /// Key used for version overrides.
    pub key: String,
    pub group: String,
    pub name: String,
    /// Version used when no override is given. `None` leaves the library out.
    #[serde(default, rename = "version")]
    pub default_version: Option<String>,
    /// Key of the library this one replaces. A fallback library is only
    /// included by default once its primary has been explicitly excluded.
    #[serde(default)]
    pub fallback_for: Option<String>,
}

impl LibrarySpec {
    pub fn new(
        key: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
        default_version: Option<&str>,
    ) -> Self {
        LibrarySpec {
            key: key.into(),
            group: group.into(),
            name: name.into(),
            default_version: default_version.map(str::to_string),
            fallback_for: None,
        }
    }

    pub fn with_fallback_for(mut self, primary: impl Into<String>) -> Self {
        self.fallback_for = Some(primary.into());
        self
    }
}

/// The set of known libraries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryCatalog {
    libraries: Vec<LibrarySpec>,
}

impl LibraryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The libraries known out of the box.
    ///
    /// None of them has a default version: each is resolved only once the
    /// manifest pins it.
    pub fn builtin() -> Self {
        let mut catalog = LibraryCatalog::new();
        catalog.add(LibrarySpec::new("xslt-stdlib", "munge", "xslt-stdlib", None));
        catalog.add(LibrarySpec::new("template-macros", "munge", "template-macros", None));
        catalog.add(
            LibrarySpec::new("template-macros-compat", "munge", "template-macros-compat", None)
                .with_fallback_for("template-macros"),
        );
        catalog
    }

    /// Add a library, replacing any library with the same key.
    pub fn add(&mut self, spec: LibrarySpec) {
        match self.libraries.iter_mut().find(|l| l.key == spec.key) {
            Some(existing) => *existing = spec,
            None => self.libraries.push(spec),
        }
    }

    pub fn get(&self, key: &str) -> Option<&LibrarySpec> {
        self.libraries.iter().find(|l| l.key == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LibrarySpec> {
        self.libraries.iter()
    }
}

/// A version override for one library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VersionSetting {
    /// Use this version.
    Version(String),
    /// `false` in configuration: leave the library out entirely.
    Excluded(ExcludedMarker),
}

/// Serialized as the boolean `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExcludedMarker;

impl Serialize for ExcludedMarker {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(false)
    }
}

impl<'de> Deserialize<'de> for ExcludedMarker {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match bool::deserialize(deserializer)? {
            false => Ok(ExcludedMarker),
            true => Err(serde::de::Error::custom(
                "expected a version string or `false` to exclude the library",
            )),
        }
    }
}

impl VersionSetting {
    pub fn version(v: impl Into<String>) -> Self {
        VersionSetting::Version(v.into())
    }

    pub fn excluded() -> Self {
        VersionSetting::Excluded(ExcludedMarker)
    }

    pub fn is_excluded(&self) -> bool {
        matches!(self, VersionSetting::Excluded(_))
    }
}

/// Explicit version choices, keyed by library key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LibraryVersions {
    overrides: BTreeMap<String, VersionSetting>,
}

impl LibraryVersions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a library to a version.
    pub fn set_version(&mut self, key: impl Into<String>, version: impl Into<String>) {
        self.overrides
            .insert(key.into(), VersionSetting::version(version));
    }

    /// Leave a library out of the resolved set.
    pub fn exclude(&mut self, key: impl Into<String>) {
        self.overrides.insert(key.into(), VersionSetting::excluded());
    }

    pub fn set(&mut self, key: impl Into<String>, setting: VersionSetting) {
        self.overrides.insert(key.into(), setting);
    }

    pub fn get(&self, key: &str) -> Option<&VersionSetting> {
        self.overrides.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VersionSetting)> {
        self.overrides.iter()
    }

    /// The coordinates to resolve for `catalog` under these overrides.
    ///
    /// Overrides for keys missing from the catalog are ignored.
    pub fn coordinates(&self, catalog: &LibraryCatalog) -> Vec<Coordinate> {
        catalog
            .iter()
            .filter_map(|spec| {
                self.effective_version(spec)
                    .map(|version| Coordinate::new(&spec.group, &spec.name, version))
            })
            .collect()
    }

    fn effective_version(&self, spec: &LibrarySpec) -> Option<String> {
        match self.overrides.get(&spec.key) {
            Some(VersionSetting::Version(v)) => Some(v.clone()),
            Some(VersionSetting::Excluded(_)) => None,
            None => match &spec.fallback_for {
                Some(primary) => {
                    let primary_excluded = self
                        .overrides
                        .get(primary)
                        .is_some_and(VersionSetting::is_excluded);
                    if primary_excluded {
                        spec.default_version.clone()
                    } else {
                        None
                    }
                }
                None => spec.default_version.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(coords: &[Coordinate]) -> Vec<String> {
        coords.iter().map(|c| c.to_string()).collect()
    }

    /// A catalog with defaults and a fallback pair.
    fn catalog() -> LibraryCatalog {
        let mut catalog = LibraryCatalog::new();
        catalog.add(LibrarySpec::new("stdlib", "org.example", "stdlib", None));
        catalog.add(LibrarySpec::new("macros", "org.example", "macros", Some("1.0.0")));
        catalog.add(
            LibrarySpec::new("macros-compat", "org.example", "macros-compat", Some("0.9.0"))
                .with_fallback_for("macros"),
        );
        catalog
    }

    #[test]
    fn test_builtin_libraries_are_opt_in() {
        let catalog = LibraryCatalog::builtin();
        assert_eq!(catalog.iter().count(), 3);
        assert!(LibraryVersions::new().coordinates(&catalog).is_empty());

        let mut versions = LibraryVersions::new();
        versions.set_version("template-macros", "1.2.0");
        assert_eq!(
            names(&versions.coordinates(&catalog)),
            vec!["munge:template-macros:1.2.0"]
        );
    }

    #[test]
    fn test_defaults() {
        let coords = LibraryVersions::new().coordinates(&catalog());
        assert_eq!(names(&coords), vec!["org.example:macros:1.0.0"]);
    }

    #[test]
    fn test_explicit_version_wins() {
        let mut versions = LibraryVersions::new();
        versions.set_version("macros", "2.1.0");
        versions.set_version("stdlib", "3.0");

        let coords = versions.coordinates(&catalog());
        assert_eq!(
            names(&coords),
            vec!["org.example:stdlib:3.0", "org.example:macros:2.1.0"]
        );
    }

    #[test]
    fn test_excluding_primary_enables_fallback_default() {
        let mut versions = LibraryVersions::new();
        versions.exclude("macros");

        let coords = versions.coordinates(&catalog());
        assert_eq!(names(&coords), vec!["org.example:macros-compat:0.9.0"]);
    }

    #[test]
    fn test_explicit_fallback_setting_is_respected() {
        let mut versions = LibraryVersions::new();
        versions.exclude("macros");
        versions.exclude("macros-compat");
        assert!(versions.coordinates(&catalog()).is_empty());

        let mut versions = LibraryVersions::new();
        versions.set_version("macros-compat", "0.8.0");
        let coords = versions.coordinates(&catalog());
        assert_eq!(
            names(&coords),
            vec!["org.example:macros:1.0.0", "org.example:macros-compat:0.8.0"]
        );
    }

    #[test]
    fn test_versions_deserialize_from_toml() {
        let versions: LibraryVersions = toml::from_str(
            r#"
            template-macros = false
            xslt-stdlib = "1.4"
            "#,
        )
        .unwrap();

        assert!(versions.get("template-macros").unwrap().is_excluded());
        assert_eq!(
            versions.get("xslt-stdlib"),
            Some(&VersionSetting::version("1.4"))
        );

        let err = toml::from_str::<LibraryVersions>("xslt-stdlib = true");
        assert!(err.is_err());
    }

    #[test]
    fn test_catalog_add_replaces_same_key() {
        let mut catalog = LibraryCatalog::builtin();
        catalog.add(LibrarySpec::new("xslt-stdlib", "org.example", "xsl", Some("9")));

        assert_eq!(catalog.iter().count(), 3);
        assert_eq!(catalog.get("xslt-stdlib").unwrap().group, "org.example");
    }
}
