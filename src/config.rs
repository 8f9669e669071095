//! Configuration management for peerroom
//!
//! Loads and saves the capture defaults, ICE server list, signaling endpoint and
//! log filter from a TOML file.

use crate::errors::SessionError;
use crate::media::MediaConstraints;
use crate::webrtc::{IceServer, RTCConfiguration};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRoomConfig {
    pub media: MediaConfig,
    pub ice: IceConfig,
    pub signaling: SignalingConfig,
    pub logging: LoggingConfig,
}

/// Default capture request used when joining without local media
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Capture microphone audio
    pub audio: bool,
    /// Capture camera video
    pub video: bool,
    /// Ideal video width in pixels
    pub ideal_width: u32,
    /// Ideal video height in pixels
    pub ideal_height: u32,
    /// Ideal frames per second
    pub ideal_frame_rate: u32,
}

/// ICE servers used for candidate gathering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceConfig {
    /// Public STUN endpoints. Relay (TURN) servers are not supported.
    pub stun_servers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Relay endpoint for the WebSocket adapter
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// env_logger filter used when RUST_LOG is not set
    pub filter: String,
}

impl Default for PeerRoomConfig {
    fn default() -> Self {
        Self {
            media: MediaConfig {
                audio: true,
                video: true,
                ideal_width: 640,
                ideal_height: 480,
                ideal_frame_rate: 30,
            },
            ice: IceConfig {
                stun_servers: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
            },
            signaling: SignalingConfig {
                url: "ws://127.0.0.1:3000".to_string(),
            },
            logging: LoggingConfig {
                filter: "peerroom=info".to_string(),
            },
        }
    }
}

impl PeerRoomConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, SessionError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("Failed to read config file: {}", e)))?;

        let config: PeerRoomConfig = toml::from_str(&contents)
            .map_err(|e| SessionError::Config(format!("Failed to parse config file: {}", e)))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), SessionError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                SessionError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| SessionError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| SessionError::Config(format!("Failed to write config file: {}", e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("peerroom.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if !self.media.audio && !self.media.video {
            return Err("At least one of audio or video must be captured".to_string());
        }
        if self.media.ideal_width == 0 || self.media.ideal_height == 0 {
            return Err("Invalid ideal resolution".to_string());
        }
        if self.media.ideal_frame_rate == 0 || self.media.ideal_frame_rate > 240 {
            return Err("Invalid ideal frame rate (must be 1-240)".to_string());
        }

        if self.ice.stun_servers.is_empty() {
            return Err("At least one STUN server is required".to_string());
        }
        for url in &self.ice.stun_servers {
            if url.starts_with("turn:") || url.starts_with("turns:") {
                return Err(format!("Relay servers are not supported: {}", url));
            }
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(format!("Not a STUN url: {}", url));
            }
        }

        if self.signaling.url.trim().is_empty() {
            return Err("Signaling url must not be empty".to_string());
        }

        Ok(())
    }

    /// Constraints used for the first capture of a session
    pub fn default_constraints(&self) -> MediaConstraints {
        MediaConstraints::from_config(&self.media)
    }

    /// Peer connection configuration built from the STUN list
    pub fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![IceServer {
                urls: self.ice.stun_servers.clone(),
            }],
        }
    }
}
