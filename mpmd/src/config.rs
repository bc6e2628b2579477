//! Daemon configuration, read once at start from a `key=value` file.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    KeyNotFoundError(String),
    ParseError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IoError(error) => write!(f, "I/O error: {}", error),
            Error::KeyNotFoundError(name) => {
                write!(f, "Configuration key `{}` not found", name)
            }
            Error::ParseError(what) => write!(f, "Configuration parse error: {}", what),
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::IoError(error)
    }
}

pub struct Config {
    values: BTreeMap<String, String>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let contents = fs::read_to_string(path)?;
        Config::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Config> {
        let mut values = BTreeMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.find('=') {
                Some(split) => {
                    values.insert(
                        line[..split].trim().to_string(),
                        line[split + 1..].trim().to_string(),
                    );
                }
                None => return Err(Error::ParseError(format!("no `=` in line `{}`", line))),
            }
        }
        Ok(Config { values })
    }

    /// An empty configuration, used when no config file is present.
    pub fn empty() -> Config {
        Config {
            values: BTreeMap::new(),
        }
    }

    pub fn read_str(&self, key: &str) -> Result<&str> {
        self.values
            .get(key)
            .map(|s| s.as_str())
            .ok_or_else(|| Error::KeyNotFoundError(key.to_string()))
    }

    pub fn read_u64(&self, key: &str) -> Result<u64> {
        self.read_str(key)?
            .parse()
            .map_err(|_| Error::ParseError(format!("key `{}` is not an integer", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys_and_skips_comments() {
        let cfg = Config::parse(
            "# daemon settings\n\
             rpc_port = 49601\n\
             chdr_ifaces=sfp0,sfp1\n\
             \n",
        )
        .unwrap();
        assert_eq!(cfg.read_u64("rpc_port").unwrap(), 49601);
        assert_eq!(cfg.read_str("chdr_ifaces").unwrap(), "sfp0,sfp1");
        match cfg.read_str("absent") {
            Err(Error::KeyNotFoundError(_)) => (),
            other => panic!("expected KeyNotFoundError, got {:?}", other),
        }
    }

    #[test]
    fn malformed_line_is_a_parse_error() {
        assert!(Config::parse("rpc_port 49601").is_err());
    }
}
