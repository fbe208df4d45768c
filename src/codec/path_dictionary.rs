//! Static, bidirectional mapping between well-known telemetry paths and compact numeric ids.
//!
//! Ids are assigned sequentially in table order, so both ends of a link derive identical tables
//!  from the same crate version. The table is append-only: inserting or reordering entries
//!  changes ids and breaks compatibility with peers running an older version.
//!
//! This is a bandwidth optimization, not a schema: paths that are not in the table pass through
//!  unchanged in both directions, and so do ids that are not in the table.

use std::sync::LazyLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::model::{Delta, PathRef};

pub struct PathCategory {
    pub name: &'static str,
    pub prefix: &'static str,
    pub suffixes: &'static [&'static str],
}

pub const CATEGORIES: &[PathCategory] = &[
    PathCategory {
        name: "navigation",
        prefix: "navigation",
        suffixes: &[
            "speedOverGround",
            "courseOverGroundTrue",
            "courseOverGroundMagnetic",
            "headingTrue",
            "headingMagnetic",
            "magneticVariation",
            "magneticDeviation",
            "rateOfTurn",
            "speedThroughWater",
            "speedThroughWaterTransverse",
            "speedThroughWaterLongitudinal",
            "leewayAngle",
            "position",
            "position.altitude",
            "attitude",
            "attitude.roll",
            "attitude.pitch",
            "attitude.yaw",
            "log",
            "trip.log",
            "trip.lastReset",
            "state",
            "datetime",
            "destination.commonName",
            "destination.eta",
            "destination.waypoint",
            "gnss.satellites",
            "gnss.satellitesInView",
            "gnss.antennaAltitude",
            "gnss.horizontalDilution",
            "gnss.positionDilution",
            "gnss.geoidalSeparation",
            "gnss.type",
            "gnss.methodQuality",
            "gnss.integrity",
            "courseRhumbline.crossTrackError",
            "courseRhumbline.bearingTrackTrue",
            "courseRhumbline.nextPoint.position",
            "courseRhumbline.nextPoint.distance",
            "courseRhumbline.nextPoint.bearingTrue",
            "courseRhumbline.nextPoint.velocityMadeGood",
            "courseRhumbline.nextPoint.timeToGo",
            "courseGreatCircle.crossTrackError",
            "courseGreatCircle.bearingTrackTrue",
            "courseGreatCircle.nextPoint.position",
            "courseGreatCircle.nextPoint.distance",
            "courseGreatCircle.nextPoint.bearingTrue",
            "courseGreatCircle.nextPoint.velocityMadeGood",
            "courseGreatCircle.nextPoint.timeToGo",
            "course.activeRoute",
            "course.nextPoint",
            "course.previousPoint",
            "course.calcValues.distance",
            "course.calcValues.bearingTrue",
            "course.calcValues.crossTrackError",
            "course.calcValues.timeToGo",
            "anchor.position",
            "anchor.maxRadius",
            "anchor.currentRadius",
        ],
    },
    PathCategory {
        name: "environment",
        prefix: "environment",
        suffixes: &[
            "wind.angleApparent",
            "wind.speedApparent",
            "wind.angleTrueWater",
            "wind.angleTrueGround",
            "wind.speedTrue",
            "wind.speedOverGround",
            "wind.directionTrue",
            "wind.directionMagnetic",
            "depth.belowKeel",
            "depth.belowTransducer",
            "depth.belowSurface",
            "depth.transducerToKeel",
            "depth.surfaceToTransducer",
            "water.temperature",
            "water.salinity",
            "outside.temperature",
            "outside.dewPointTemperature",
            "outside.apparentWindChillTemperature",
            "outside.theoreticalWindChillTemperature",
            "outside.heatIndexTemperature",
            "outside.pressure",
            "outside.humidity",
            "outside.relativeHumidity",
            "outside.airDensity",
            "outside.illuminance",
            "inside.temperature",
            "inside.humidity",
            "inside.relativeHumidity",
            "inside.engineRoom.temperature",
            "inside.refrigerator.temperature",
            "inside.freezer.temperature",
            "current.drift",
            "current.setTrue",
            "current.setMagnetic",
            "tide.heightHigh",
            "tide.heightLow",
            "tide.heightNow",
            "tide.timeLow",
            "tide.timeHigh",
            "sunlight.times.sunrise",
            "sunlight.times.sunset",
            "mode",
        ],
    },
    PathCategory {
        name: "electrical",
        prefix: "electrical",
        suffixes: &[
            "batteries.house.voltage",
            "batteries.house.current",
            "batteries.house.power",
            "batteries.house.temperature",
            "batteries.house.capacity.stateOfCharge",
            "batteries.house.capacity.remaining",
            "batteries.house.capacity.timeRemaining",
            "batteries.starter.voltage",
            "batteries.starter.current",
            "batteries.starter.temperature",
            "batteries.starter.capacity.stateOfCharge",
            "inverters.main.ac.voltage",
            "inverters.main.ac.current",
            "inverters.main.ac.frequency",
            "inverters.main.dc.voltage",
            "chargers.main.voltage",
            "chargers.main.current",
            "chargers.main.chargingMode",
            "solar.main.voltage",
            "solar.main.current",
            "solar.main.panelPower",
            "solar.main.chargingMode",
            "alternators.main.voltage",
            "alternators.main.current",
            "ac.shore.phase.A.lineNeutralVoltage",
            "ac.shore.phase.A.current",
            "ac.shore.phase.A.frequency",
            "ac.shore.phase.A.realPower",
        ],
    },
    PathCategory {
        name: "propulsion",
        prefix: "propulsion",
        suffixes: &[
            "main.revolutions",
            "main.state",
            "main.temperature",
            "main.oilTemperature",
            "main.oilPressure",
            "main.coolantTemperature",
            "main.coolantPressure",
            "main.exhaustTemperature",
            "main.boostPressure",
            "main.fuel.rate",
            "main.fuel.used",
            "main.fuel.pressure",
            "main.runTime",
            "main.engineLoad",
            "main.engineTorque",
            "main.transmission.gear",
            "main.transmission.oilTemperature",
            "main.transmission.oilPressure",
            "main.drive.trimState",
            "port.revolutions",
            "port.temperature",
            "port.oilPressure",
            "port.runTime",
            "starboard.revolutions",
            "starboard.temperature",
            "starboard.oilPressure",
            "starboard.runTime",
        ],
    },
    PathCategory {
        name: "steering",
        prefix: "steering",
        suffixes: &[
            "rudderAngle",
            "rudderAngleTarget",
            "autopilot.state",
            "autopilot.mode",
            "autopilot.target.headingTrue",
            "autopilot.target.headingMagnetic",
            "autopilot.target.windAngleApparent",
            "autopilot.deadZone",
            "autopilot.backlash",
            "autopilot.gain",
        ],
    },
    PathCategory {
        name: "tanks",
        prefix: "tanks",
        suffixes: &[
            "fuel.0.currentLevel",
            "fuel.0.currentVolume",
            "fuel.0.capacity",
            "fuel.1.currentLevel",
            "freshWater.0.currentLevel",
            "freshWater.0.currentVolume",
            "freshWater.0.capacity",
            "wasteWater.0.currentLevel",
            "blackWater.0.currentLevel",
            "lubrication.0.currentLevel",
            "liveWell.0.currentLevel",
            "gas.0.currentLevel",
        ],
    },
    PathCategory {
        name: "performance",
        prefix: "performance",
        suffixes: &[
            "polarSpeed",
            "polarSpeedRatio",
            "velocityMadeGood",
            "velocityMadeGoodToWaypoint",
            "beatAngle",
            "beatAngleVelocityMadeGood",
            "gybeAngle",
            "gybeAngleVelocityMadeGood",
            "targetAngle",
            "targetSpeed",
            "leeway",
            "tackMagnetic",
            "tackTrue",
        ],
    },
    PathCategory {
        name: "design",
        prefix: "design",
        suffixes: &[
            "length",
            "beam",
            "draft",
            "airHeight",
            "aisShipType",
        ],
    },
    PathCategory {
        name: "sensors",
        prefix: "sensors",
        suffixes: &[
            "gps.fromBow",
            "gps.fromCenter",
            "ais.class",
            "ais.fromBow",
            "ais.fromCenter",
        ],
    },
    PathCategory {
        name: "communication",
        prefix: "communication",
        suffixes: &[
            "callsignVhf",
            "callsignHf",
            "crewNames",
        ],
    },
    PathCategory {
        name: "notifications",
        prefix: "notifications",
        suffixes: &[
            "mob",
            "fire",
            "sinking",
            "flooding",
            "collision",
            "grounding",
            "abandon",
            "anchor",
        ],
    },
    PathCategory {
        name: "networking",
        prefix: "networking",
        suffixes: &[
            "modem.rtt",
            "modem.latency",
            "modem.connectionQuality",
        ],
    },
];

static STANDARD: LazyLock<PathDictionary> = LazyLock::new(|| PathDictionary::new(CATEGORIES));

pub struct PathDictionary {
    ids_by_path: FxHashMap<String, u16>,
    paths_by_id: Vec<String>,
    category_by_id: Vec<&'static str>,
}

impl PathDictionary {
    /// The dictionary shared by all endpoints, built once on first use
    pub fn standard() -> &'static PathDictionary {
        &STANDARD
    }

    pub fn new(categories: &[PathCategory]) -> PathDictionary {
        let mut ids_by_path = FxHashMap::default();
        let mut paths_by_id = Vec::new();
        let mut category_by_id = Vec::new();

        for category in categories {
            for suffix in category.suffixes {
                let path = format!("{}.{}", category.prefix, suffix);
                let id: u16 = paths_by_id.len().try_into()
                    .expect("path dictionary exceeds the u16 id range");
                let prev = ids_by_path.insert(path.clone(), id);
                assert!(prev.is_none(), "duplicate path dictionary entry {}", path);
                paths_by_id.push(path);
                category_by_id.push(category.name);
            }
        }

        PathDictionary {
            ids_by_path,
            paths_by_id,
            category_by_id,
        }
    }

    pub fn len(&self) -> usize {
        self.paths_by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths_by_id.is_empty()
    }

    pub fn id_for(&self, path: &str) -> Option<u16> {
        self.ids_by_path.get(path).copied()
    }

    pub fn path_for(&self, id: u16) -> Option<&str> {
        self.paths_by_id.get(id as usize).map(|p| p.as_str())
    }

    pub fn category_for(&self, id: u16) -> Option<&'static str> {
        self.category_by_id.get(id as usize).copied()
    }

    pub fn encode(&self, delta: &Delta) -> Delta {
        let mut result = delta.clone();
        self.encode_in_place(&mut result);
        result
    }

    pub fn decode(&self, delta: &Delta) -> Delta {
        let mut result = delta.clone();
        self.decode_in_place(&mut result);
        result
    }

    pub fn encode_in_place(&self, delta: &mut Delta) {
        for value in delta.updates.iter_mut().flat_map(|u| u.values.iter_mut()) {
            if let PathRef::Name(name) = &value.path {
                if let Some(id) = self.id_for(name) {
                    value.path = PathRef::Id(id);
                }
            }
        }
    }

    pub fn decode_in_place(&self, delta: &mut Delta) {
        for value in delta.updates.iter_mut().flat_map(|u| u.values.iter_mut()) {
            if let PathRef::Id(id) = value.path {
                match self.path_for(id) {
                    Some(path) => value.path = PathRef::Name(path.to_string()),
                    None => trace!("path id {} is not in the dictionary - leaving it as is", id),
                }
            }
        }
    }
}
