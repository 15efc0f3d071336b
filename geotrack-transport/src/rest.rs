use anyhow::{anyhow, bail};
use log::{debug, warn};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use geotrack_logic::{Coordinates, DeviceHome, prelude::*};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// What a successful login hands back
pub struct LoginSession {
    pub token: String,
    /// User record as the backend returned it
    pub user: Value,
}

/// Numbers sometimes come back as strings from the web forms
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_device_home(value: &Value) -> Result<DeviceHome> {
    let location = value.get("location");
    let latitude = location.and_then(|l| l.get("latitude")).and_then(number);
    let longitude = location.and_then(|l| l.get("longitude")).and_then(number);

    let (Some(latitude), Some(longitude)) = (latitude, longitude) else {
        bail!("No valid location data available");
    };

    let device_name = string(value.get("deviceName"))
        .or_else(|| string(value.get("device").and_then(|d| d.get("deviceName"))));

    Ok(DeviceHome {
        home: Coordinates::new(latitude, longitude),
        geofence_radius_km: value.get("geofenceRadius").and_then(number),
        unique_id: string(value.get("uniqueId")),
        device_name,
    })
}

/// The response is `{token, userData}`, older backends send the user record flat with the
/// token mixed in
fn parse_login(value: Value) -> Result<LoginSession> {
    let user_data = value.get("userData").filter(|u| u.is_object()).cloned();

    let token = string(value.get("token"))
        .or_else(|| string(user_data.as_ref().and_then(|u| u.get("token"))))
        .ok_or_else(|| anyhow!("Login response has no token"))?;

    let user = match user_data {
        Some(user) => user,
        None => match value {
            Value::Object(mut fields) => {
                fields.remove("token");
                Value::Object(fields)
            }
            other => other,
        },
    };

    Ok(LoginSession { token, user })
}

fn error_message(body: &str, fallback: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| string(v.get("message")))
        .unwrap_or_else(|| fallback.to_string())
}

/// REST client for the tracking backend
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the registered home and geofence of `device_id`
    pub async fn device_home(&self, device_id: &str, token: &str) -> Result<DeviceHome> {
        let url = format!("{}/location/home/{device_id}", self.base_url);
        debug!("Fetching home of {device_id}");

        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .context("Could not send request")?;

        if !resp.status().is_success() {
            bail!("Failed to fetch location data ({})", resp.status());
        }

        let value = resp
            .json::<Value>()
            .await
            .context("Home location response isn't JSON")?;

        parse_device_home(&value)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginSession> {
        let url = format!("{}/auth/login", self.base_url);

        let resp = self
            .http
            .post(url)
            .json(&json!({ "emailId": email, "password": password }))
            .send()
            .await
            .context("Network error")?;

        let status = resp.status();
        if status.is_success() {
            let value = resp
                .json::<Value>()
                .await
                .context("Login response isn't JSON")?;
            parse_login(value)
        } else {
            let body = resp.text().await.unwrap_or_default();
            let fallback = if status == StatusCode::UNAUTHORIZED {
                "Invalid email or password"
            } else {
                "Login failed"
            };
            bail!("{}", error_message(&body, fallback))
        }
    }
}

const GEOCODE_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";

/// Turns coordinates into a printable address with the Google Geocoding API
pub struct GoogleGeocoder {
    http: reqwest::Client,
    api_key: String,
}

fn parse_geocode(value: &Value) -> Option<String> {
    if value.get("status").and_then(Value::as_str) != Some("OK") {
        return None;
    }
    value
        .get("results")
        .and_then(Value::as_array)
        .and_then(|results| results.first())
        .and_then(|first| string(first.get("formatted_address")))
}

impl GoogleGeocoder {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            api_key: api_key.into(),
        })
    }

    /// Address of `coords`, [None] if Google doesn't know one
    pub async fn reverse_geocode(&self, coords: Coordinates) -> Result<Option<String>> {
        let latlng = format!("{},{}", coords.latitude, coords.longitude);
        let url = format!("{GEOCODE_URL}?latlng={latlng}&key={}", self.api_key);
        let value = self
            .http
            .get(url)
            .send()
            .await
            .context("Could not send request")?
            .error_for_status()
            .context("Geocoding service returned error")?
            .json::<Value>()
            .await
            .context("Geocoding response isn't JSON")?;

        let address = parse_geocode(&value);
        if address.is_none() {
            warn!(
                "No address found for {latlng} (status {})",
                value.get("status").and_then(Value::as_str).unwrap_or("?")
            );
        }
        Ok(address)
    }
}
