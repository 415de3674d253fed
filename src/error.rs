use std::fmt;

#[derive(Debug)]
pub enum PriceListError {
    Io(std::io::Error),
    Csv(Box<csv::Error>),
    Config(String),
    NotReady(String),
    Other(String),
}

impl fmt::Display for PriceListError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceListError::Io(e) => write!(f, "IO error: {}", e),
            PriceListError::Csv(e) => write!(f, "CSV error: {}", e),
            PriceListError::Config(e) => write!(f, "Configuration error: {}", e),
            PriceListError::NotReady(e) => write!(f, "Result not ready: {}", e),
            PriceListError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for PriceListError {}

impl From<std::io::Error> for PriceListError {
    fn from(err: std::io::Error) -> Self {
        PriceListError::Io(err)
    }
}

impl From<csv::Error> for PriceListError {
    fn from(err: csv::Error) -> Self {
        PriceListError::Csv(Box::new(err))
    }
}

impl From<serde_json::Error> for PriceListError {
    fn from(err: serde_json::Error) -> Self {
        PriceListError::Config(err.to_string())
    }
}

impl From<String> for PriceListError {
    fn from(err: String) -> Self {
        PriceListError::Other(err)
    }
}

impl From<&str> for PriceListError {
    fn from(err: &str) -> Self {
        PriceListError::Other(err.to_string())
    }
}
