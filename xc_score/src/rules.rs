//! League identifiers and the rule tables handed to the scoring engine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ScoreError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum League {
    CzechLocal,
    CzechEurope,
    CzechOutsideEurope,
    Ffvl,
    Leonardo,
    Norway,
    UkClub,
    UkInternational,
    UkNational,
    XContest,
    XContestPpg,
    WorldXc,
}

impl League {
    pub const ALL: [League; 12] = [
        League::CzechLocal,
        League::CzechEurope,
        League::CzechOutsideEurope,
        League::Ffvl,
        League::Leonardo,
        League::Norway,
        League::UkClub,
        League::UkInternational,
        League::UkNational,
        League::XContest,
        League::XContestPpg,
        League::WorldXc,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            League::CzechLocal => "czl",
            League::CzechEurope => "cze",
            League::CzechOutsideEurope => "czo",
            League::Ffvl => "fr",
            League::Leonardo => "leo",
            League::Norway => "nor",
            League::UkClub => "ukc",
            League::UkInternational => "uki",
            League::UkNational => "ukn",
            League::XContest => "xc",
            League::XContestPpg => "xcppg",
            League::WorldXc => "wxc",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        League::ALL.into_iter().find(|league| league.code() == code)
    }

    pub fn rules(&self) -> &'static RuleTable {
        &RULE_TABLES[*self as usize]
    }
}

impl FromStr for League {
    type Err = ScoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        League::from_code(s).ok_or_else(|| ScoreError::UnknownLeague(s.to_string()))
    }
}

/// Engine-specific ruleset for one league. The engine owns the numbers; this
/// crate only selects which ruleset applies.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct RuleTable {
    pub league: League,
    /// Ruleset name understood by the engine.
    pub rule_set: &'static str,
}

// Ordered like `League` so the discriminant indexes the table.
static RULE_TABLES: [RuleTable; 12] = [
    RuleTable {
        league: League::CzechLocal,
        rule_set: "CzechLocal",
    },
    RuleTable {
        league: League::CzechEurope,
        rule_set: "CzechEurope",
    },
    RuleTable {
        league: League::CzechOutsideEurope,
        rule_set: "CzechOutsideEurope",
    },
    RuleTable {
        league: League::Ffvl,
        rule_set: "FFVL",
    },
    RuleTable {
        league: League::Leonardo,
        rule_set: "Leonardo",
    },
    RuleTable {
        league: League::Norway,
        rule_set: "Norway",
    },
    RuleTable {
        league: League::UkClub,
        rule_set: "UKClub",
    },
    RuleTable {
        league: League::UkInternational,
        rule_set: "UKInternational",
    },
    RuleTable {
        league: League::UkNational,
        rule_set: "UKNational",
    },
    RuleTable {
        league: League::XContest,
        rule_set: "XContest",
    },
    RuleTable {
        league: League::XContestPpg,
        rule_set: "XContestPPG",
    },
    RuleTable {
        league: League::WorldXc,
        rule_set: "WorldXC",
    },
];

/// Resolves a league identifier such as `"fr"` or `"xc"`. Unknown identifiers
/// are an error, never a fallback ruleset.
pub fn resolve_league(league_id: &str) -> Result<&'static RuleTable, ScoreError> {
    league_id.parse::<League>().map(|league| league.rules())
}
