// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! ONVIF adapter — snapshot-over-HTTP.
//!
//! Setup resolves the media service through `GetCapabilities`, lists media
//! profiles, picks the first and asks for its snapshot URI. Captures are a
//! plain HTTP GET with digest authentication against that URI. The SOAP
//! requests are built inline; no WSDL files are required at runtime.

use std::time::Duration;

use async_trait::async_trait;
use diqwest::WithDigestAuth;
use quick_xml::events::Event;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::camera::{CameraAdapter, Frame};
use crate::config::{AdvancedConfig, CameraConfig, CameraKindConfig};
use crate::error::{AgentError, Result};

const SOAP_CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

const GET_DEVICE_INFORMATION: &str = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">
  <s:Body>
    <tds:GetDeviceInformation xmlns:tds="http://www.onvif.org/ver10/device/wsdl"/>
  </s:Body>
</s:Envelope>"#;

const GET_CAPABILITIES: &str = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">
  <s:Body>
    <tds:GetCapabilities xmlns:tds="http://www.onvif.org/ver10/device/wsdl">
      <tds:Category>Media</tds:Category>
    </tds:GetCapabilities>
  </s:Body>
</s:Envelope>"#;

const GET_PROFILES: &str = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">
  <s:Body>
    <trt:GetProfiles xmlns:trt="http://www.onvif.org/ver10/media/wsdl"/>
  </s:Body>
</s:Envelope>"#;

fn get_snapshot_uri_request(profile_token: &str) -> String {
    format!(
        r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">
  <s:Body>
    <trt:GetSnapshotUri xmlns:trt="http://www.onvif.org/ver10/media/wsdl">
      <trt:ProfileToken>{profile_token}</trt:ProfileToken>
    </trt:GetSnapshotUri>
  </s:Body>
</s:Envelope>"#
    )
}

/// Collect the text content of every element with the given local name.
fn xml_texts(xml: &str, local: &str) -> Vec<String> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut out = Vec::new();
    let mut capture = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                capture = e.local_name().as_ref() == local.as_bytes();
            }
            Ok(Event::Text(t)) if capture => {
                if let Ok(text) = t.unescape() {
                    out.push(text.into_owned());
                }
                capture = false;
            }
            Ok(Event::End(_)) => capture = false,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    out
}

/// Collect an attribute value from every element with the given local name.
fn xml_attrs(xml: &str, local: &str, attr: &str) -> Vec<String> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut out = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == local.as_bytes() {
                    for a in e.attributes().flatten() {
                        if a.key.local_name().as_ref() == attr.as_bytes() {
                            if let Ok(v) = a.unescape_value() {
                                out.push(v.into_owned());
                            }
                        }
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    out
}

pub struct OnvifCamera {
    config: CameraConfig,
    advanced: AdvancedConfig,
    client: reqwest::Client,
    snapshot_uri: Option<String>,
    media_xaddr: Option<String>,
    device_model: Option<String>,
    connected: bool,
}

impl OnvifCamera {
    pub fn new(config: CameraConfig, advanced: AdvancedConfig) -> Self {
        let timeout = match &config.kind {
            CameraKindConfig::Onvif { timeout, .. } => *timeout,
            _ => 30,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .unwrap_or_default();
        Self {
            config,
            advanced,
            client,
            snapshot_uri: None,
            media_xaddr: None,
            device_model: None,
            connected: false,
        }
    }

    fn params(&self) -> (&str, u16, &str, &str) {
        match &self.config.kind {
            CameraKindConfig::Onvif { address, port, username, password, .. } => {
                (address, *port, username, password)
            }
            _ => ("", 0, "", ""),
        }
    }

    async fn soap_call(&self, url: &str, body: &'static str) -> Result<String> {
        self.soap_call_owned(url, body.to_string()).await
    }

    async fn soap_call_owned(&self, url: &str, body: String) -> Result<String> {
        let (_, _, username, password) = self.params();
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .body(body)
            .send_with_digest_auth(username, password)
            .await
            .map_err(|e| AgentError::Onvif(format!("SOAP request failed: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AgentError::Onvif(format!("SOAP response read failed: {e}")))?;
        if !status.is_success() {
            return Err(AgentError::Onvif(format!("SOAP HTTP {status}")));
        }
        Ok(text)
    }
}

#[async_trait]
impl CameraAdapter for OnvifCamera {
    async fn setup(&mut self) -> Result<()> {
        let (address, port, _, _) = self.params();
        let address = address.to_string();
        info!(
            camera = %self.config.id,
            address = %address,
            port,
            "Initializing ONVIF camera"
        );

        // `ONVIF_WSDL_PATH` / `wsdl_dir` are accepted for compatibility with
        // deployments that used a WSDL-based client; requests here are built
        // inline and need no schema files.
        let wsdl_hint = std::env::var("ONVIF_WSDL_PATH").ok().or_else(|| {
            match &self.config.kind {
                CameraKindConfig::Onvif { wsdl_dir: Some(dir), .. } => {
                    Some(dir.display().to_string())
                }
                _ => None,
            }
        });
        if let Some(hint) = wsdl_hint {
            debug!(camera = %self.config.id, wsdl_dir = %hint, "WSDL hint present but unused");
        }

        let device_service = format!("http://{address}:{port}/onvif/device_service");

        // Device information is informational only; failures don't block setup.
        match self.soap_call(&device_service, GET_DEVICE_INFORMATION).await {
            Ok(xml) => {
                let manufacturer = xml_texts(&xml, "Manufacturer").into_iter().next();
                let model = xml_texts(&xml, "Model").into_iter().next();
                if let (Some(manufacturer), Some(model)) = (&manufacturer, &model) {
                    info!(
                        camera = %self.config.id,
                        "Connected to {manufacturer} {model}"
                    );
                }
                self.device_model = model;
            }
            Err(e) => {
                warn!(camera = %self.config.id, error = %e, "Could not get device info");
            }
        }

        // Resolve the media service address.
        let capabilities = self.soap_call(&device_service, GET_CAPABILITIES).await?;
        let media_xaddr = xml_texts(&capabilities, "XAddr")
            .into_iter()
            .next()
            .unwrap_or_else(|| format!("http://{address}:{port}/onvif/Media"));

        // List media profiles, use the first.
        let profiles = self.soap_call(&media_xaddr, GET_PROFILES).await?;
        let token = xml_attrs(&profiles, "Profiles", "token")
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Onvif("No ONVIF media profiles found".into()))?;
        if let Some(name) = xml_texts(&profiles, "Name").into_iter().next() {
            info!(camera = %self.config.id, profile = %name, "Using ONVIF profile");
        }

        // Resolve the snapshot URI for that profile.
        let snapshot = self
            .soap_call_owned(&media_xaddr, get_snapshot_uri_request(&token))
            .await?;
        let uri = xml_texts(&snapshot, "Uri")
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Onvif("GetSnapshotUri returned no Uri".into()))?;

        info!(camera = %self.config.id, "ONVIF snapshot URI obtained");
        debug!(camera = %self.config.id, uri = %uri, "Snapshot URI");

        self.media_xaddr = Some(media_xaddr);
        self.snapshot_uri = Some(uri);
        self.connected = true;
        Ok(())
    }

    async fn capture_frame(&mut self) -> Result<Frame> {
        let Some(uri) = self.snapshot_uri.clone() else {
            debug!(camera = %self.config.id, "Not connected or no snapshot URI");
            return Err(AgentError::Capture("no snapshot URI".into()));
        };
        let (_, _, username, password) = self.params();

        debug!(camera = %self.config.id, "Downloading ONVIF snapshot");
        let response = self
            .client
            .get(&uri)
            .send_with_digest_auth(username, password)
            .await
            .map_err(|e| {
                debug!(camera = %self.config.id, error = %e, "ONVIF snapshot transport error");
                AgentError::Capture(format!("snapshot request failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            if status == reqwest::StatusCode::UNAUTHORIZED {
                warn!(camera = %self.config.id, "Authentication failed, check credentials");
            } else {
                debug!(camera = %self.config.id, status = %status, "ONVIF snapshot HTTP error");
            }
            return Err(AgentError::Capture(format!("snapshot HTTP {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AgentError::Capture(format!("snapshot body read failed: {e}")))?;
        let image = image::load_from_memory(&bytes)
            .map_err(|e| {
                debug!(camera = %self.config.id, error = %e, "Failed to decode image data");
                AgentError::Capture(format!("snapshot decode failed: {e}"))
            })?
            .to_rgb8();

        debug!(camera = %self.config.id, "ONVIF snapshot captured");
        Ok(Frame::new(image))
    }

    async fn reconnect(&mut self) -> Result<()> {
        debug!(camera = %self.config.id, "ONVIF reconnecting");
        self.cleanup();
        tokio::time::sleep(Duration::from_secs(self.advanced.reconnect_delay)).await;
        self.setup().await
    }

    fn cleanup(&mut self) {
        debug!(camera = %self.config.id, "Cleaning up ONVIF resources");
        self.snapshot_uri = None;
        self.media_xaddr = None;
        self.connected = false;
    }

    fn info(&self) -> serde_json::Value {
        let (address, port, username, _) = self.params();
        json!({
            "camera_id": self.config.id,
            "type": "onvif",
            "address": address,
            "port": port,
            "username": username,
            "model": self.device_model,
            "is_connected": self.connected,
            "snapshot_uri_available": self.snapshot_uri.is_some(),
            "capture_interval": self.config.capture_interval,
        })
    }

    fn kind(&self) -> &'static str {
        "onvif"
    }
}
