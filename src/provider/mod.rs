use std::collections::HashMap;

use crate::coord::TileCoordinate;

/// Tile servers known out of the box, keyed by map type.
const BUILTIN_PROVIDERS: &[(&str, &str)] = &[
    (
        "gaode",
        "http://webrd02.is.autonavi.com/appmaptile?lang=zh_cn&size=1&scale=1&style=7&x={x}&y={y}&z={z}",
    ),
    (
        "gaode.image",
        "http://webst02.is.autonavi.com/appmaptile?style=6&x={x}&y={y}&z={z}",
    ),
    (
        "gaode.road",
        "http://webst02.is.autonavi.com/appmaptile?x={x}&y={y}&z={z}&lang=zh_cn&size=1&scale=1&style=8",
    ),
    ("tianditu", "http://t2.tianditu.cn/DataServer?T=vec_w&X={x}&Y={y}&L={z}"),
    ("tianditusat", "http://t2.tianditu.cn/DataServer?T=img_w&X={x}&Y={y}&L={z}"),
    ("googlesat", "http://khm0.googleapis.com/kh?v=203&hl=zh-CN&&x={x}&y={y}&z={z}"),
    (
        "esrisat",
        "http://server.arcgisonline.com/arcgis/rest/services/world_imagery/mapserver/tile/{z}/{y}/{x}",
    ),
    ("default", "http://a.tile.openstreetmap.org/{z}/{x}/{y}.png"),
    ("openstreet", "http://a.tile.openstreetmap.org/{z}/{x}/{y}.png"),
    ("szbuilding", "http://61.144.226.124:9001/map/GISDATA/SZBUILDING/{z}/{y}/{x}.png"),
    (
        "szbase",
        "http://61.144.226.44:6080/arcgis/rest/services/basemap/szmap_basemap_201507_01/MapServer/tile/{z}/{y}/{x}",
    ),
];

/// A tile URL with `{x}`, `{y}` and `{z}` placeholders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UrlTemplate(String);

impl UrlTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Substitutes the tile's address into the template.
    pub fn render(&self, tile: &TileCoordinate) -> String {
        self.0
            .replace("{x}", &tile.x.to_string())
            .replace("{y}", &tile.y.to_string())
            .replace("{z}", &tile.z.to_string())
    }
}

/// Immutable map from provider id to URL template, built once per run and
/// handed to the fetcher.
#[derive(Clone, Debug, Default)]
pub struct ProviderTable {
    templates: HashMap<String, UrlTemplate>,
}

impl ProviderTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Table preloaded with the built-in tile servers.
    pub fn builtin() -> Self {
        let templates = BUILTIN_PROVIDERS
            .iter()
            .map(|(id, template)| (id.to_string(), UrlTemplate::new(*template)))
            .collect();
        Self { templates }
    }

    /// Adds or replaces entries, returning the extended table.
    pub fn with_entries<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (id, template) in entries {
            self.templates.insert(id.into(), UrlTemplate::new(template));
        }
        self
    }

    /// Template for `id`. Unknown ids are taken to be templates themselves.
    pub fn resolve(&self, id: &str) -> UrlTemplate {
        self.templates
            .get(id)
            .cloned()
            .unwrap_or_else(|| UrlTemplate::new(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.templates.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
