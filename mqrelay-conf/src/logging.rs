use serde::Deserialize;
use slog::Level;

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::to_default")]
    pub to: To,
    #[serde(default = "Log::level_default", deserialize_with = "deserialize_level")]
    pub level: Level,
    #[serde(default = "Log::filename_default")]
    pub filename: String,
}

impl Default for Log {
    fn default() -> Self {
        Self { to: Self::to_default(), level: Self::level_default(), filename: Self::filename_default() }
    }
}

impl Log {
    fn to_default() -> To {
        To::Console
    }
    fn level_default() -> Level {
        Level::Info
    }
    fn filename_default() -> String {
        "mqrelay.log".into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum To {
    Off,
    Console,
    File,
    Both,
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<Level, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let l = String::deserialize(deserializer)?;
    l.parse::<Level>().map_err(|_| serde::de::Error::custom(format!("invalid log level '{}'", l)))
}
