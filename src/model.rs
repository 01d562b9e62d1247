use serde::{Deserialize, Serialize};

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Time range `[start, end)`.
///
/// Construction never validates; use [`Interval::is_valid`] where the caller
/// needs `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub start: Ms,
    pub end: Ms,
}

impl Interval {
    pub const fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Open-interval overlap: touching at a boundary is not an overlap.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Intersection of both intervals, `None` when they share no time.
    pub fn restrict_to(&self, other: &Interval) -> Option<Interval> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start >= end {
            None
        } else {
            Some(Interval { start, end })
        }
    }
}

/// Secondary access token attached to a booking after creation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub token: String,
    #[serde(flatten)]
    pub interval: Interval,
}

impl std::fmt::Debug for AccessGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGrant")
            .field("token", &"<redacted>")
            .field("interval", &self.interval)
            .finish()
    }
}

/// A customer's reservation of one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: String,
    pub customer_id: String,
    #[serde(flatten)]
    pub interval: Interval,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessGrant>,
}

impl Booking {
    pub fn new(id: String, customer_id: impl Into<String>, interval: Interval) -> Self {
        Self {
            id,
            customer_id: customer_id.into(),
            interval,
            access: None,
        }
    }
}

/// The per-asset document: identity plus every booking held on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBookings {
    #[serde(rename = "_id")]
    pub asset_id: String,
    #[serde(default)]
    pub bookings: Vec<Booking>,
}

/// WAL record format for the document engine.
///
/// Bodies are stored as JSON text: bincode cannot encode self-describing
/// `serde_json::Value`s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    DocumentWritten {
        collection: String,
        id: String,
        body: String,
    },
    DocumentDeleted {
        collection: String,
        id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_basics() {
        let s = Interval::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
        assert!(s.is_valid());
        assert!(!Interval::new(200, 200).is_valid());
        assert!(!Interval::new(300, 200).is_valid());
    }

    #[test]
    fn interval_overlap() {
        let a = Interval::new(100, 200);
        let b = Interval::new(150, 250);
        let c = Interval::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn overlap_is_symmetric() {
        let spans = [
            Interval::new(0, 10),
            Interval::new(5, 15),
            Interval::new(10, 20),
            Interval::new(-5, 0),
            Interval::new(2, 3),
            Interval::new(0, 100),
        ];
        for a in &spans {
            for b in &spans {
                assert_eq!(a.overlaps(b), b.overlaps(a), "{a:?} vs {b:?}");
                assert_eq!(a.restrict_to(b), b.restrict_to(a), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn restrict_to_self_is_identity() {
        let a = Interval::new(1_000, 2_000);
        assert_eq!(a.restrict_to(&a), Some(a));
    }

    #[test]
    fn restrict_to_intersection() {
        let a = Interval::new(100, 300);
        let b = Interval::new(200, 400);
        assert_eq!(a.restrict_to(&b), Some(Interval::new(200, 300)));

        let inner = Interval::new(150, 160);
        assert_eq!(a.restrict_to(&inner), Some(inner));
    }

    #[test]
    fn restrict_to_touching_or_disjoint_is_none() {
        let a = Interval::new(100, 200);
        assert_eq!(a.restrict_to(&Interval::new(200, 300)), None);
        assert_eq!(a.restrict_to(&Interval::new(500, 600)), None);
    }

    #[test]
    fn booking_document_layout() {
        let booking = Booking::new("abc123".into(), "cust1", Interval::new(10, 20));
        let value = serde_json::to_value(&booking).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"id": "abc123", "customer_id": "cust1", "start": 10, "end": 20})
        );
        let decoded: Booking = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, booking);
    }

    #[test]
    fn access_grant_debug_redacts_token() {
        let grant = AccessGrant {
            token: "s3cr3t-token".into(),
            interval: Interval::new(1, 2),
        };
        let printed = format!("{grant:?}");
        assert!(!printed.contains("s3cr3t"));
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn asset_bookings_reads_identity_field() {
        let doc = serde_json::json!({
            "_id": "VIN1",
            "bookings": [{"id": "b1", "customer_id": "c", "start": 1, "end": 2,
                          "access": {"token": "t", "start": 1, "end": 2}}]
        });
        let asset: AssetBookings = serde_json::from_value(doc).unwrap();
        assert_eq!(asset.asset_id, "VIN1");
        assert_eq!(asset.bookings.len(), 1);
        assert_eq!(
            asset.bookings[0].access.as_ref().map(|g| g.interval),
            Some(Interval::new(1, 2))
        );
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::DocumentWritten {
            collection: "cars".into(),
            id: "VIN1".into(),
            body: r#"{"_id":"VIN1","bookings":[]}"#.into(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
