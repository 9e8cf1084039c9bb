// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Activity type table and destination display names.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of workout, independent of any one provider's naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityType {
    #[default]
    Unspecified,
    Run,
    TrailRun,
    VirtualRun,
    Walk,
    Hike,
    Ride,
    MountainBikeRide,
    GravelRide,
    VirtualRide,
    EBikeRide,
    Swim,
    WeightTraining,
    Yoga,
    Workout,
    HighIntensityIntervalTraining,
    Crossfit,
    Elliptical,
    StairStepper,
    Rowing,
    Pilates,
    Tennis,
    Soccer,
    AlpineSki,
    NordicSki,
    Kayaking,
}

/// (variant, canonical name, destination display name)
const TABLE: &[(ActivityType, &str, &str)] = &[
    (ActivityType::Unspecified, "UNSPECIFIED", "Workout"),
    (ActivityType::Run, "RUN", "Run"),
    (ActivityType::TrailRun, "TRAIL_RUN", "TrailRun"),
    (ActivityType::VirtualRun, "VIRTUAL_RUN", "VirtualRun"),
    (ActivityType::Walk, "WALK", "Walk"),
    (ActivityType::Hike, "HIKE", "Hike"),
    (ActivityType::Ride, "RIDE", "Ride"),
    (
        ActivityType::MountainBikeRide,
        "MOUNTAIN_BIKE_RIDE",
        "MountainBikeRide",
    ),
    (ActivityType::GravelRide, "GRAVEL_RIDE", "GravelRide"),
    (ActivityType::VirtualRide, "VIRTUAL_RIDE", "VirtualRide"),
    (ActivityType::EBikeRide, "E_BIKE_RIDE", "EBikeRide"),
    (ActivityType::Swim, "SWIM", "Swim"),
    (ActivityType::WeightTraining, "WEIGHT_TRAINING", "WeightTraining"),
    (ActivityType::Yoga, "YOGA", "Yoga"),
    (ActivityType::Workout, "WORKOUT", "Workout"),
    (
        ActivityType::HighIntensityIntervalTraining,
        "HIGH_INTENSITY_INTERVAL_TRAINING",
        "HighIntensityIntervalTraining",
    ),
    (ActivityType::Crossfit, "CROSSFIT", "Crossfit"),
    (ActivityType::Elliptical, "ELLIPTICAL", "Elliptical"),
    (ActivityType::StairStepper, "STAIR_STEPPER", "StairStepper"),
    (ActivityType::Rowing, "ROWING", "Rowing"),
    (ActivityType::Pilates, "PILATES", "Pilates"),
    (ActivityType::Tennis, "TENNIS", "Tennis"),
    (ActivityType::Soccer, "SOCCER", "Soccer"),
    (ActivityType::AlpineSki, "ALPINE_SKI", "AlpineSki"),
    (ActivityType::NordicSki, "NORDIC_SKI", "NordicSki"),
    (ActivityType::Kayaking, "KAYAKING", "Kayaking"),
];

/// Common names people (and providers) use for the same thing.
const ALIASES: &[(&str, ActivityType)] = &[
    ("running", ActivityType::Run),
    ("jog", ActivityType::Run),
    ("trailrun", ActivityType::TrailRun),
    ("walking", ActivityType::Walk),
    ("hiking", ActivityType::Hike),
    ("cycling", ActivityType::Ride),
    ("biking", ActivityType::Ride),
    ("bike", ActivityType::Ride),
    ("mtb", ActivityType::MountainBikeRide),
    ("swimming", ActivityType::Swim),
    ("weights", ActivityType::WeightTraining),
    ("strength", ActivityType::WeightTraining),
    ("strength_training", ActivityType::WeightTraining),
    ("hiit", ActivityType::HighIntensityIntervalTraining),
    ("row", ActivityType::Rowing),
    ("skiing", ActivityType::AlpineSki),
    ("kayak", ActivityType::Kayaking),
];

impl ActivityType {
    /// Every variant, in table order.
    pub fn all() -> impl Iterator<Item = ActivityType> {
        TABLE.iter().map(|(t, _, _)| *t)
    }

    fn entry(self) -> &'static (ActivityType, &'static str, &'static str) {
        // Every variant has a row; the table test enforces it.
        TABLE
            .iter()
            .find(|(t, _, _)| *t == self)
            .unwrap_or(&TABLE[0])
    }

    /// Canonical name, e.g. `TRAIL_RUN`.
    pub fn canonical_name(self) -> &'static str {
        self.entry().1
    }

    /// Name destinations expect, e.g. `TrailRun`.
    pub fn display_name(self) -> &'static str {
        self.entry().2
    }

    /// Case-insensitive lookup by canonical name, display name, or a common alias.
    ///
    /// Unknown input maps to [`ActivityType::Unspecified`].
    pub fn parse(input: &str) -> ActivityType {
        let trimmed = input.trim();
        let stripped = trimmed
            .get(..14)
            .filter(|p| p.eq_ignore_ascii_case("ACTIVITY_TYPE_"))
            .map(|_| &trimmed[14..])
            .unwrap_or(trimmed);

        if let Some((t, _, _)) = TABLE.iter().find(|(_, canonical, display)| {
            canonical.eq_ignore_ascii_case(stripped) || display.eq_ignore_ascii_case(stripped)
        }) {
            return *t;
        }

        ALIASES
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(stripped))
            .map(|(_, t)| *t)
            .unwrap_or_default()
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}
