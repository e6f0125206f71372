//! Static region table: region code, observer platform ID and spectator host.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    /// Short code used on the command line, e.g. `euw`.
    pub code: &'static str,
    /// Platform ID used by the observer protocol, e.g. `EUW1`.
    pub platform_id: &'static str,
    /// `host[:port]` of the spectator endpoint.
    pub spectator_host: &'static str,
}

pub const REGIONS: &[Region] = &[
    Region {
        code: "br",
        platform_id: "BR1",
        spectator_host: "spectator.br.lol.riotgames.com",
    },
    Region {
        code: "eune",
        platform_id: "EUN1",
        spectator_host: "spectator.eu.lol.riotgames.com:8088",
    },
    Region {
        code: "euw",
        platform_id: "EUW1",
        spectator_host: "spectator.euw1.lol.riotgames.com",
    },
    Region {
        code: "kr",
        platform_id: "KR1",
        spectator_host: "spectator.kr.lol.riotgames.com",
    },
    Region {
        code: "lan",
        platform_id: "LA1",
        spectator_host: "spectator.la1.lol.riotgames.com",
    },
    Region {
        code: "las",
        platform_id: "LA2",
        spectator_host: "spectator.la2.lol.riotgames.com",
    },
    Region {
        code: "na",
        platform_id: "NA1",
        spectator_host: "spectator.na.lol.riotgames.com",
    },
    Region {
        code: "oce",
        platform_id: "OC1",
        spectator_host: "spectator.oc1.lol.riotgames.com",
    },
    Region {
        code: "tr",
        platform_id: "TR1",
        spectator_host: "spectator.tr.lol.riotgames.com",
    },
    Region {
        code: "ru",
        platform_id: "RU1",
        spectator_host: "spectator.ru.lol.riotgames.com",
    },
    Region {
        code: "pbe",
        platform_id: "PBE1",
        spectator_host: "spectator.pbe1.lol.riotgames.com:8088",
    },
    // static data only, no observer endpoint
    Region {
        code: "global",
        platform_id: "",
        spectator_host: "",
    },
];

impl Region {
    pub fn by_code(code: &str) -> Option<&'static Region> {
        REGIONS.iter().find(|r| r.code.eq_ignore_ascii_case(code))
    }

    pub fn by_platform_id(platform_id: &str) -> Option<&'static Region> {
        if platform_id.is_empty() {
            return None;
        }
        REGIONS
            .iter()
            .find(|r| r.platform_id.eq_ignore_ascii_case(platform_id))
    }

    /// Accepts either a region code (`euw`) or a platform ID (`EUW1`).
    pub fn lookup(name: &str) -> Option<&'static Region> {
        Self::by_code(name).or_else(|| Self::by_platform_id(name))
    }

    /// True when both the platform ID and the spectator host are known.
    pub fn is_spectatable(&self) -> bool {
        !self.platform_id.is_empty() && !self.spectator_host.is_empty()
    }

    pub fn spectatable() -> impl Iterator<Item = &'static Region> {
        REGIONS.iter().filter(|r| r.is_spectatable())
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_code_or_platform() {
        let euw = Region::by_code("euw").unwrap();
        assert_eq!(euw.platform_id, "EUW1");
        assert_eq!(euw.spectator_host, "spectator.euw1.lol.riotgames.com");
        assert_eq!(Region::lookup("EUW1"), Some(euw));
        assert_eq!(Region::lookup("EUW"), Some(euw));
        assert_eq!(Region::lookup("xx"), None);
    }

    #[test]
    fn global_is_not_spectatable() {
        let global = Region::by_code("global").unwrap();
        assert!(!global.is_spectatable());
        assert_eq!(Region::by_platform_id(""), None);
        assert_eq!(Region::spectatable().count(), REGIONS.len() - 1);
    }
}
