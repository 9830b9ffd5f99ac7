//! The closed set of key/value representations an operation can carry.

/// How an item's bytes are interpreted.
///
/// Selected once, when an operation is bound to a data source, from the data
/// source's declared format string. `"r"` declares a record number; every
/// other format is carried as opaque bytes and left to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemFormat {
    RecordNumber,
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("empty format string")]
    Empty,
}

impl ItemFormat {
    pub fn parse(format: &str) -> Result<Self, FormatError> {
        match format.trim() {
            "" => Err(FormatError::Empty),
            "r" => Ok(ItemFormat::RecordNumber),
            _ => Ok(ItemFormat::Raw),
        }
    }
}

impl std::fmt::Display for ItemFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemFormat::RecordNumber => write!(f, "record number"),
            ItemFormat::Raw => write!(f, "raw bytes"),
        }
    }
}

/// Key and value formats of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Formats {
    pub key: ItemFormat,
    pub value: ItemFormat,
}

impl Formats {
    pub const RAW: Formats = Formats {
        key: ItemFormat::Raw,
        value: ItemFormat::Raw,
    };

    pub fn parse(key_format: &str, value_format: &str) -> Result<Self, FormatError> {
        Ok(Formats {
            key: ItemFormat::parse(key_format)?,
            value: ItemFormat::parse(value_format)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        assert_eq!(ItemFormat::parse("r"), Ok(ItemFormat::RecordNumber));
        assert_eq!(ItemFormat::parse("u"), Ok(ItemFormat::Raw));
        assert_eq!(ItemFormat::parse("S"), Ok(ItemFormat::Raw));
        assert_eq!(ItemFormat::parse(" "), Err(FormatError::Empty));
        assert_eq!(
            Formats::parse("r", "u"),
            Ok(Formats {
                key: ItemFormat::RecordNumber,
                value: ItemFormat::Raw
            })
        );
    }
}
