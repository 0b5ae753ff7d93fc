pub use anyhow::{anyhow, bail, Error, Result};
pub use log::{debug, error, info, trace, warn};
pub use serde::{Deserialize, Serialize};
pub use std::io::Write;
pub use std::str::FromStr;
pub use tokio::sync::{broadcast, mpsc, watch};

pub use crate::{
    cache::{self, CacheStats, LocalCache},
    channels::Channels,
    config::{self, Config, ConfigWrapper},
    coordinator::{self, Coordinator},
    device::{self, DeviceReader, DeviceReading},
    mode::Mode,
    mqtt::{self, Publisher},
    options::Options,
    register,
    remote::{self, RemoteStore},
    sync::{SyncEngine, SyncResult},
    utils::Utils,
};
