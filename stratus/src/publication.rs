use chrono::{DateTime, Utc};

/// A queued outbound data point.
///
/// Publications are buffered by [`DeviceClient::queue_publish`] and drained in
/// batches into a single envelope by the connection handler.
///
/// [`DeviceClient::queue_publish`]: crate::DeviceClient::queue_publish
#[derive(Debug, Clone)]
pub enum Publication {
    /// A numeric property sample.
    Telemetry {
        name: String,
        value: f64,
        timestamp: Option<DateTime<Utc>>,
    },
    /// A string attribute.
    Attribute {
        name: String,
        value: String,
        timestamp: Option<DateTime<Utc>>,
    },
    /// An alarm state change.
    Alarm {
        name: String,
        state: i32,
        message: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    },
    /// A position fix.
    Location {
        latitude: f64,
        longitude: f64,
        heading: Option<f64>,
        altitude: Option<f64>,
        speed: Option<f64>,
        accuracy: Option<f64>,
        fix_type: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    },
    /// A line for the cloud-side log.
    Log {
        message: String,
        timestamp: Option<DateTime<Utc>>,
    },
}

impl Publication {
    /// Fills in a missing timestamp. Called once, when the publication enters
    /// the queue.
    pub(crate) fn stamp(&mut self, now: DateTime<Utc>) {
        let timestamp = match self {
            Publication::Telemetry { timestamp, .. }
            | Publication::Attribute { timestamp, .. }
            | Publication::Alarm { timestamp, .. }
            | Publication::Location { timestamp, .. }
            | Publication::Log { timestamp, .. } => timestamp,
        };
        timestamp.get_or_insert(now);
    }

    /// Short description used in send logging.
    pub(crate) fn describe(&self) -> String {
        match self {
            Publication::Telemetry { name, value, .. } => {
                format!("Property Publish {name} : {value}")
            }
            Publication::Attribute { name, value, .. } => {
                format!("Attribute Publish {name} : {value:?}")
            }
            Publication::Alarm { name, state, .. } => format!("Alarm Publish {name} : {state}"),
            Publication::Location {
                latitude,
                longitude,
                ..
            } => format!("Location Publish {latitude},{longitude}"),
            Publication::Log { message, .. } => format!("Log Publish {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_fills_only_missing_timestamps() {
        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(90);

        let mut fresh = Publication::Log {
            message: "hello".into(),
            timestamp: None,
        };
        fresh.stamp(now);
        assert!(matches!(fresh, Publication::Log { timestamp: Some(t), .. } if t == now));

        let mut stamped = Publication::Telemetry {
            name: "t".into(),
            value: 1.0,
            timestamp: Some(earlier),
        };
        stamped.stamp(now);
        assert!(
            matches!(stamped, Publication::Telemetry { timestamp: Some(t), .. } if t == earlier)
        );
    }
}
