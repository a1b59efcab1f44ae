//! Sample and frame data model
//!
//! Samples are what the upstream provider hands us; frames are what the
//! generator emits. Timestamps are UTC instants, positions are in the
//! provider's planar track coordinates (x/y), and the optional scalar
//! channels ride along with every position.
//!
//! Frames serialize to a compact wire shape so the stream stays small:
//!
//! ```text
//! {"t":"2024-03-02T15:03:00.200Z","fields":["n","x","y","v"],"entities":[[1,512.5,-80.0,287.0],[44,...]]}
//! ```

use crate::error::ReplayError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

pub type Timestamp = DateTime<Utc>;

/// Stable numeric id of a tracked car
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = ReplayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(EntityId)
            .map_err(|_| ReplayError::malformed("drivers", format!("'{}' is not an entity id", s)))
    }
}

/// Value channels carried by a sample or an interpolated row.
///
/// `speed` is continuous and gets interpolated; `gear` is discrete and is
/// held or switched, never blended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Channels {
    pub x: f64,
    pub y: f64,
    pub speed: Option<f64>,
    pub gear: Option<i8>,
}

impl Channels {
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            speed: None,
            gear: None,
        }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_gear(mut self, gear: i8) -> Self {
        self.gear = Some(gear);
        self
    }

    /// Bit-for-bit equality, so `NaN == NaN` and `0.0 != -0.0`.
    pub fn same_as(&self, other: &Channels) -> bool {
        self.x.to_bits() == other.x.to_bits()
            && self.y.to_bits() == other.y.to_bits()
            && self.speed.map(f64::to_bits) == other.speed.map(f64::to_bits)
            && self.gear == other.gear
    }

    pub fn distance_to(&self, other: &Channels) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// One raw observation from the upstream provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub entity_id: EntityId,
    pub timestamp: Timestamp,
    pub channels: Channels,
}

impl Sample {
    pub fn new(entity_id: EntityId, timestamp: Timestamp, channels: Channels) -> Self {
        Self {
            entity_id,
            timestamp,
            channels,
        }
    }
}

/// Time-ordered samples of one entity within a fetched window
#[derive(Debug, Clone, PartialEq)]
pub struct EntityTimeline {
    entity_id: EntityId,
    samples: Vec<Sample>,
}

impl EntityTimeline {
    /// Build a timeline, stable-sorting by timestamp. Samples sharing a
    /// timestamp keep their arrival order and are not de-duplicated.
    pub fn new(entity_id: EntityId, mut samples: Vec<Sample>) -> Self {
        samples.sort_by_key(|s| s.timestamp);
        Self { entity_id, samples }
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Copy of this timeline with x and y replaced by the median of each
    /// sample and its two neighbours. The first and last samples are kept.
    ///
    /// Runs front to back over the copy, so each median already sees the
    /// cleaned value of its predecessor.
    pub fn despiked(&self) -> EntityTimeline {
        let mut samples = self.samples.clone();
        for k in 1..samples.len().saturating_sub(1) {
            let (a, b, c) = (
                samples[k - 1].channels,
                samples[k].channels,
                samples[k + 1].channels,
            );
            samples[k].channels.x = median3(a.x, b.x, c.x);
            samples[k].channels.y = median3(a.y, b.y, c.y);
        }
        EntityTimeline {
            entity_id: self.entity_id,
            samples,
        }
    }
}

fn median3(a: f64, b: f64, c: f64) -> f64 {
    a.max(b).min(a.min(b).max(c))
}

/// Timelines keyed by entity, iterated in ascending id order
pub type TimelineMap = BTreeMap<EntityId, EntityTimeline>;

/// Group loose samples into per-entity timelines.
pub fn group_samples(samples: impl IntoIterator<Item = Sample>) -> TimelineMap {
    let mut grouped: BTreeMap<EntityId, Vec<Sample>> = BTreeMap::new();
    for sample in samples {
        grouped.entry(sample.entity_id).or_default().push(sample);
    }
    grouped
        .into_iter()
        .map(|(id, samples)| (id, EntityTimeline::new(id, samples)))
        .collect()
}

/// Name of an upstream table / sample kind (e.g. `location`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityClass(pub String);

impl EntityClass {
    pub const LOCATION: &'static str = "location";

    pub fn location() -> Self {
        Self(Self::LOCATION.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntityClass {
    fn default() -> Self {
        Self::location()
    }
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Closed time range: both `from` and `to` are included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Timestamp,
    pub to: Timestamp,
}

impl TimeRange {
    pub fn new(from: Timestamp, to: Timestamp) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, t: Timestamp) -> bool {
        self.from <= t && t <= self.to
    }

    /// Widen both ends by `pad_ms`.
    pub fn padded(&self, pad_ms: u64) -> Self {
        let pad = Duration::milliseconds(pad_ms as i64);
        Self {
            from: self.from - pad,
            to: self.to + pad,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.to - self.from).num_milliseconds()
    }
}

/// Allow-list of entity ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityFilter(BTreeSet<EntityId>);

impl EntityFilter {
    /// Parse a comma-separated id list (`"1, 44,16"`). Empty input means
    /// "no filter" and yields `None`.
    pub fn parse(ids: &str) -> Result<Option<Self>, ReplayError> {
        let set = ids
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(EntityId::from_str)
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok((!set.is_empty()).then_some(Self(set)))
    }

    pub fn allows(&self, id: EntityId) -> bool {
        self.0.contains(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<EntityId> for EntityFilter {
    fn from_iter<I: IntoIterator<Item = EntityId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Which optional channels a request wants. Position is always included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSelection {
    pub speed: bool,
    pub gear: bool,
}

impl ChannelSelection {
    pub fn all() -> Self {
        Self {
            speed: true,
            gear: true,
        }
    }

    /// Parse a comma-separated channel list (`"speed,gear"`), case-insensitive.
    /// Unknown names are ignored.
    pub fn parse(include: &str) -> Self {
        let mut selection = Self::default();
        for name in include.split(',').map(|s| s.trim().to_lowercase()) {
            match name.as_str() {
                "speed" | "v" => selection.speed = true,
                "gear" | "n_gear" => selection.gear = true,
                _ => {}
            }
        }
        selection
    }

    /// Column names of a wire row, in order
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = vec!["n", "x", "y"];
        if self.speed {
            fields.push("v");
        }
        if self.gear {
            fields.push("gear");
        }
        fields
    }

    /// Drop unselected channels.
    pub fn project(&self, channels: Channels) -> Channels {
        Channels {
            speed: if self.speed { channels.speed } else { None },
            gear: if self.gear { channels.gear } else { None },
            ..channels
        }
    }
}

/// One entity's values inside a frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityRow {
    pub id: EntityId,
    pub channels: Channels,
}

/// Interpolated values of every entity at one stride timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireFrame", try_from = "WireFrame")]
pub struct Frame {
    pub t: Timestamp,
    pub fields: ChannelSelection,
    pub entities: Vec<EntityRow>,
}

impl Frame {
    /// A frame with no entity rows ("no data").
    pub fn empty(t: Timestamp, fields: ChannelSelection) -> Self {
        Self {
            t,
            fields,
            entities: Vec::new(),
        }
    }

    pub fn row(&self, id: EntityId) -> Option<&EntityRow> {
        self.entities.iter().find(|row| row.id == id)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(line: &str) -> Result<Self, ReplayError> {
        serde_json::from_str(line).map_err(|e| ReplayError::decode(e.to_string()))
    }
}

/// Compact wire representation of a [`Frame`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    pub t: Timestamp,
    pub fields: Vec<String>,
    pub entities: Vec<Vec<Value>>,
}

impl From<Frame> for WireFrame {
    fn from(frame: Frame) -> Self {
        let entities = frame
            .entities
            .iter()
            .map(|row| {
                let mut values = vec![
                    Value::from(row.id.0),
                    number_or_null(row.channels.x),
                    number_or_null(row.channels.y),
                ];
                if frame.fields.speed {
                    values.push(row.channels.speed.map_or(Value::Null, number_or_null));
                }
                if frame.fields.gear {
                    values.push(row.channels.gear.map_or(Value::Null, Value::from));
                }
                values
            })
            .collect();

        WireFrame {
            t: frame.t,
            fields: frame.fields.fields().into_iter().map(String::from).collect(),
            entities,
        }
    }
}

impl TryFrom<WireFrame> for Frame {
    type Error = ReplayError;

    fn try_from(wire: WireFrame) -> Result<Self, Self::Error> {
        let column = |name: &str| wire.fields.iter().position(|f| f == name);
        let (n, x, y) = match (column("n"), column("x"), column("y")) {
            (Some(n), Some(x), Some(y)) => (n, x, y),
            _ => return Err(ReplayError::decode("frame fields must include n, x and y")),
        };
        let v = column("v");
        let gear = column("gear");

        let entities = wire
            .entities
            .iter()
            .map(|values| {
                let id = match values.get(n) {
                    Some(Value::Number(num)) => num.as_u64().and_then(|v| u32::try_from(v).ok()),
                    Some(Value::String(s)) => s.parse().ok(),
                    _ => None,
                }
                .map(EntityId)
                .ok_or_else(|| ReplayError::decode("entity row without a valid id"))?;

                let coord = |idx: usize, name: &str| {
                    values
                        .get(idx)
                        .and_then(Value::as_f64)
                        .ok_or_else(|| ReplayError::decode(format!("entity {} has no {}", id, name)))
                };

                Ok(EntityRow {
                    id,
                    channels: Channels {
                        x: coord(x, "x")?,
                        y: coord(y, "y")?,
                        speed: v.and_then(|i| values.get(i)).and_then(Value::as_f64),
                        gear: gear
                            .and_then(|i| values.get(i))
                            .and_then(Value::as_i64)
                            .and_then(|g| i8::try_from(g).ok()),
                    },
                })
            })
            .collect::<Result<Vec<_>, ReplayError>>()?;

        Ok(Frame {
            t: wire.t,
            fields: ChannelSelection {
                speed: v.is_some(),
                gear: gear.is_some(),
            },
            entities,
        })
    }
}

fn number_or_null(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}
