//! Server catalog and user geolocation.
//!
//! The catalog is fetched from the public JSON API with the static XML list
//! as fallback; both decode into the same [`Server`] record. Distance uses
//! the spherical law of cosines and drives the default server election.

use crate::engine::ploss::PLoss;
use crate::model::{Coordinates, LatencyStats, PhaseDurations};
use crate::units::ByteRate;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

const SERVERS_API_URL: &str =
    "https://www.speedtest.net/api/js/servers?engine=js&https_functional=true";
const SERVERS_STATIC_URL: &str = "https://www.speedtest.net/speedtest-servers-static.php";
const CONFIG_URL: &str = "https://www.speedtest.net/speedtest-config.php";

/// Earth radius used by the catalog's distance sort, in kilometres.
const EARTH_RADIUS_KM: f64 = 6378.137;

/// One measurement target plus the results recorded against it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Server {
    #[serde(default)]
    pub id: String,
    /// Control endpoint, `host:port`.
    #[serde(default)]
    pub host: String,
    /// Upload endpoint URL, conventionally ending in `/upload.php`.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub lat: String,
    #[serde(default)]
    pub lon: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub sponsor: String,
    #[serde(default)]
    pub distance: f64,

    #[serde(default, skip_deserializing)]
    pub latency: Option<LatencyStats>,
    #[serde(default, skip_deserializing)]
    pub dl_rate: ByteRate,
    #[serde(default, skip_deserializing)]
    pub ul_rate: ByteRate,
    #[serde(default, skip_deserializing)]
    pub packet_loss: Option<PLoss>,
    #[serde(default, skip_deserializing)]
    pub durations: PhaseDurations,
}

impl Server {
    /// Build a server record from a custom URL of the form
    /// `<scheme>://<host>/speedtest/upload.php`.
    pub fn from_custom_url(url: &str) -> Result<Server> {
        let parsed = reqwest::Url::parse(url).context("invalid custom server url")?;
        let host = parsed.host_str().context("custom server url has no host")?;
        let port = parsed.port().unwrap_or(8080);
        Ok(Server {
            id: "custom".to_string(),
            host: format!("{host}:{port}"),
            url: url.to_string(),
            name: host.to_string(),
            sponsor: "custom".to_string(),
            ..Server::default()
        })
    }

    fn base_url(&self) -> &str {
        self.url.split("/upload").next().unwrap_or(&self.url)
    }

    /// Sibling download endpoint: `random<N>x<N>.jpg`, where the server
    /// synthesises 2·N² bytes of payload.
    pub fn download_url(&self, size_px: u32) -> String {
        format!("{}/random{size_px}x{size_px}.jpg", self.base_url())
    }

    pub fn latency_url(&self) -> String {
        format!("{}/latency.txt", self.base_url())
    }

    pub fn upload_url(&self) -> &str {
        &self.url
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        Some(Coordinates {
            lat: self.lat.parse().ok()?,
            lon: self.lon.parse().ok()?,
        })
    }

    /// A result is suspicious (flagged, not failed) when the two directions
    /// diverge beyond any plausible asymmetry.
    pub fn looks_suspicious(&self) -> bool {
        if !self.dl_rate.is_available() || !self.ul_rate.is_available() {
            return false;
        }
        let (dl, ul) = (self.dl_rate.0, self.ul_rate.0);
        dl * 100.0 < ul || dl > ul * 100.0
    }

    /// Result-record view handed to output formatters.
    pub fn report(&self) -> ServerReport {
        let lat = self.latency;
        ServerReport {
            id: self.id.clone(),
            host: self.host.clone(),
            sponsor: self.sponsor.clone(),
            name: self.name.clone(),
            country: self.country.clone(),
            distance_km: self.distance,
            latency_ns: lat.map(|l| l.mean_ns).unwrap_or(-1),
            jitter_ns: lat.map(|l| l.jitter_ns).unwrap_or(-1),
            min_latency_ns: lat.map(|l| l.min_ns).unwrap_or(-1),
            max_latency_ns: lat.map(|l| l.max_ns).unwrap_or(-1),
            dl_byte_rate: self.dl_rate,
            ul_byte_rate: self.ul_rate,
            packet_loss: self.packet_loss,
            test_duration: self.durations,
            suspicious: self.looks_suspicious(),
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:>5}] {:>8.2}km {} ({}) by {}",
            self.id, self.distance, self.name, self.country, self.sponsor
        )
    }
}

/// Flattened result record; field names are part of the output contract.
#[derive(Debug, Clone, Serialize)]
pub struct ServerReport {
    pub id: String,
    pub host: String,
    pub sponsor: String,
    pub name: String,
    pub country: String,
    pub distance_km: f64,
    pub latency_ns: i64,
    pub jitter_ns: i64,
    pub min_latency_ns: i64,
    pub max_latency_ns: i64,
    pub dl_byte_rate: ByteRate,
    pub ul_byte_rate: ByteRate,
    pub packet_loss: Option<PLoss>,
    pub test_duration: PhaseDurations,
    pub suspicious: bool,
}

/// Information determined about the caller by the catalog service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct User {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub lat: String,
    #[serde(default)]
    pub lon: String,
    #[serde(default)]
    pub isp: String,
}

impl User {
    pub fn coordinates(&self) -> Option<Coordinates> {
        Some(Coordinates {
            lat: self.lat.parse().ok()?,
            lon: self.lon.parse().ok()?,
        })
    }

    pub fn set_location(&mut self, coords: Coordinates) {
        self.lat = format!("{:.4}", coords.lat);
        self.lon = format!("{:.4}", coords.lon);
    }

    /// Replace the detected coordinates with a built-in city. Returns false
    /// when the city is unknown.
    pub fn set_location_by_city(&mut self, city: &str) -> bool {
        match city_coordinates(city) {
            Some(coords) => {
                self.set_location(coords);
                true
            }
            None => false,
        }
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) [{}, {}]", self.ip, self.isp, self.lat, self.lon)
    }
}

const CITY_TABLE: &[(&str, f64, f64)] = &[
    ("hongkong", 22.3207, 114.1689),
    ("chiyoda", 35.6869, 139.7575),
    ("london", 51.5063, -0.1201),
    ("moscow", 55.7520, 37.6175),
    ("beijing", 39.5600, 116.2000),
    ("paris", 48.8600, 2.3390),
    ("sanfrancisco", 37.7687, -122.4754),
];

pub fn city_coordinates(city: &str) -> Option<Coordinates> {
    let needle = city.to_ascii_lowercase();
    CITY_TABLE
        .iter()
        .find(|(name, _, _)| *name == needle)
        .map(|&(_, lat, lon)| Coordinates { lat, lon })
}

/// Great-circle distance in kilometres (spherical law of cosines).
pub fn distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let a1 = lat1.to_radians();
    let b1 = lon1.to_radians();
    let a2 = lat2.to_radians();
    let b2 = lon2.to_radians();

    let x = a1.sin() * a2.sin() + a1.cos() * a2.cos() * (b2 - b1).cos();
    EARTH_RADIUS_KM * x.clamp(-1.0, 1.0).acos()
}

#[derive(Debug, Clone, Default)]
pub struct ServerList {
    pub servers: Vec<Server>,
}

impl ServerList {
    /// Recompute distances against the user's coordinates and sort nearest
    /// first.
    pub fn sort_by_distance(&mut self, user: &User) {
        let user_coords = user.coordinates();
        for server in &mut self.servers {
            if let (Some(u), Some(s)) = (user_coords, server.coordinates()) {
                server.distance = distance(s.lat, s.lon, u.lat, u.lon);
            }
        }
        self.servers
            .sort_by(|a, b| a.distance.total_cmp(&b.distance));
    }

    /// Keep servers whose name, sponsor or country matches the substring.
    pub fn filter_keyword(&mut self, keyword: &str) {
        let needle = keyword.to_ascii_lowercase();
        self.servers.retain(|s| {
            s.name.to_ascii_lowercase().contains(&needle)
                || s.sponsor.to_ascii_lowercase().contains(&needle)
                || s.country.to_ascii_lowercase().contains(&needle)
        });
    }

    /// Select servers by id, falling back to the nearest server when none of
    /// the requested ids are present.
    pub fn find_servers(&self, ids: &[String]) -> Result<Vec<Server>> {
        if self.servers.is_empty() {
            anyhow::bail!("no servers available");
        }
        let mut selected: Vec<Server> = Vec::new();
        for id in ids {
            for server in &self.servers {
                if &server.id == id {
                    selected.push(server.clone());
                }
            }
        }
        if selected.is_empty() {
            selected.push(self.servers[0].clone());
        }
        Ok(selected)
    }
}

impl fmt::Display for ServerList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for server in &self.servers {
            writeln!(f, "{server}")?;
        }
        Ok(())
    }
}

/// Fetch the server catalog. The JSON API is authoritative; the static XML
/// list covers deployments where the API is unreachable.
pub async fn fetch_servers(
    http: &reqwest::Client,
    user: &User,
    keyword: Option<&str>,
) -> Result<ServerList> {
    let mut servers = fetch_servers_api(http, keyword).await;
    if servers.as_ref().map(|s| s.is_empty()).unwrap_or(true) {
        servers = fetch_servers_static(http).await;
    }
    let servers = servers.context("unable to retrieve server list")?;
    if servers.is_empty() {
        anyhow::bail!("unable to retrieve server list");
    }

    let mut list = ServerList { servers };
    // the API filters server-side; the static list needs the same treatment
    if let Some(keyword) = keyword {
        list.filter_keyword(keyword);
        if list.servers.is_empty() {
            anyhow::bail!("no servers match keyword '{keyword}'");
        }
    }
    list.sort_by_distance(user);
    Ok(list)
}

async fn fetch_servers_api(http: &reqwest::Client, keyword: Option<&str>) -> Result<Vec<Server>> {
    let mut url = reqwest::Url::parse(SERVERS_API_URL).expect("static url");
    if let Some(keyword) = keyword {
        url.query_pairs_mut().append_pair("search", keyword);
    }
    let servers: Vec<Server> = http.get(url).send().await?.error_for_status()?.json().await?;
    Ok(servers)
}

async fn fetch_servers_static(http: &reqwest::Client) -> Result<Vec<Server>> {
    let body = http
        .get(SERVERS_STATIC_URL)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    parse_servers_xml(&body)
}

/// Decode `<server .../>` elements out of the static XML list.
pub fn parse_servers_xml(text: &str) -> Result<Vec<Server>> {
    let mut servers = Vec::new();
    let mut current: Option<Server> = None;
    for token in xmlparser::Tokenizer::from(text) {
        match token.context("malformed server list xml")? {
            xmlparser::Token::ElementStart { local, .. } => {
                if local.as_str() == "server" {
                    current = Some(Server::default());
                }
            }
            xmlparser::Token::Attribute { local, value, .. } => {
                if let Some(server) = current.as_mut() {
                    let value = value.as_str().to_string();
                    match local.as_str() {
                        "url" => server.url = value,
                        "lat" => server.lat = value,
                        "lon" => server.lon = value,
                        "name" => server.name = value,
                        "country" => server.country = value,
                        "sponsor" => server.sponsor = value,
                        "id" => server.id = value,
                        "host" => server.host = value,
                        _ => {}
                    }
                }
            }
            xmlparser::Token::ElementEnd { .. } => {
                if let Some(server) = current.take() {
                    servers.push(server);
                }
            }
            _ => {}
        }
    }
    Ok(servers)
}

/// Fetch the caller's information (IP, coordinates, ISP) from the catalog
/// configuration endpoint.
pub async fn fetch_user(http: &reqwest::Client) -> Result<User> {
    let body = http
        .get(CONFIG_URL)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    parse_user_xml(&body)
}

pub fn parse_user_xml(text: &str) -> Result<User> {
    let mut current: Option<User> = None;
    for token in xmlparser::Tokenizer::from(text) {
        match token.context("malformed configuration xml")? {
            xmlparser::Token::ElementStart { local, .. } => {
                if local.as_str() == "client" {
                    current = Some(User::default());
                }
            }
            xmlparser::Token::Attribute { local, value, .. } => {
                if let Some(user) = current.as_mut() {
                    let value = value.as_str().to_string();
                    match local.as_str() {
                        "ip" => user.ip = value,
                        "lat" => user.lat = value,
                        "lon" => user.lon = value,
                        "isp" => user.isp = value,
                        _ => {}
                    }
                }
            }
            xmlparser::Token::ElementEnd { .. } => {
                if let Some(user) = current.take() {
                    return Ok(user);
                }
            }
            _ => {}
        }
    }
    anyhow::bail!("failed to fetch user information")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<settings>
<servers>
<server url="http://example.net/speedtest/upload.php" lat="50.05" lon="19.95"
        name="Krakow" country="Poland" sponsor="ISP" id="4029"
        host="example.net:8080" />
</servers>
</settings>"#;

    const SERVER_JSON: &str = r#"[{
        "url": "http://example.net/speedtest/upload.php",
        "lat": "50.05", "lon": "19.95",
        "name": "Krakow", "country": "Poland", "sponsor": "ISP",
        "id": "4029", "host": "example.net:8080",
        "preferred": 0, "https_functional": 1
    }]"#;

    #[test]
    fn xml_and_json_decode_to_the_same_record() {
        let from_xml = parse_servers_xml(SERVER_XML).unwrap();
        let from_json: Vec<Server> = serde_json::from_str(SERVER_JSON).unwrap();
        assert_eq!(from_xml.len(), 1);
        assert_eq!(from_xml, from_json);
        // and JSON round-trips through serde
        let reencoded = serde_json::to_string(&from_json).unwrap();
        let decoded: Vec<Server> = serde_json::from_str(&reencoded).unwrap();
        assert_eq!(decoded[0].id, "4029");
        assert_eq!(decoded[0].host, "example.net:8080");
    }

    #[test]
    fn user_xml_decodes_client_element() {
        let xml = r#"<settings><client ip="203.0.113.9" lat="35.68" lon="139.75" isp="ExampleNet"/></settings>"#;
        let user = parse_user_xml(xml).unwrap();
        assert_eq!(user.ip, "203.0.113.9");
        assert_eq!(user.isp, "ExampleNet");
        assert_eq!(
            user.coordinates().unwrap(),
            Coordinates { lat: 35.68, lon: 139.75 }
        );
    }

    #[test]
    fn user_xml_without_client_fails() {
        assert!(parse_user_xml("<settings></settings>").is_err());
    }

    #[test]
    fn endpoint_urls_derive_from_upload_php() {
        let server = Server {
            url: "http://example.net/speedtest/upload.php".into(),
            ..Server::default()
        };
        assert_eq!(
            server.download_url(1000),
            "http://example.net/speedtest/random1000x1000.jpg"
        );
        assert_eq!(server.latency_url(), "http://example.net/speedtest/latency.txt");
        assert_eq!(server.upload_url(), "http://example.net/speedtest/upload.php");
    }

    #[test]
    fn custom_url_builds_a_server() {
        let server = Server::from_custom_url("https://test.example.org/speedtest/upload.php").unwrap();
        assert_eq!(server.host, "test.example.org:8080");
        assert_eq!(server.id, "custom");
        assert_eq!(
            server.download_url(500),
            "https://test.example.org/speedtest/random500x500.jpg"
        );
        assert!(Server::from_custom_url("not a url").is_err());
    }

    #[test]
    fn distance_identity_and_symmetry() {
        let coords = [(35.68, 139.75), (50.05, 19.95), (-33.86, 151.20), (0.0, 0.0)];
        for &(lat, lon) in &coords {
            assert_eq!(distance(lat, lon, lat, lon), 0.0);
        }
        for &(lat1, lon1) in &coords {
            for &(lat2, lon2) in &coords {
                let ab = distance(lat1, lon1, lat2, lon2);
                let ba = distance(lat2, lon2, lat1, lon1);
                assert!((ab - ba).abs() < 1e-9);
            }
        }
        // Tokyo to Krakow is around 8,600 km
        let d = distance(35.68, 139.75, 50.05, 19.95);
        assert!((8000.0..9500.0).contains(&d), "distance {d}");
    }

    #[test]
    fn sort_and_find_fall_back_to_nearest() {
        let far = Server {
            id: "1".into(),
            lat: "0.0".into(),
            lon: "60.0".into(),
            ..Server::default()
        };
        let near = Server {
            id: "2".into(),
            lat: "0.0".into(),
            lon: "1.0".into(),
            ..Server::default()
        };
        let mut list = ServerList { servers: vec![far, near] };
        let user = User {
            lat: "0.0".into(),
            lon: "0.0".into(),
            ..User::default()
        };
        list.sort_by_distance(&user);
        assert_eq!(list.servers[0].id, "2");

        // explicit id match
        let picked = list.find_servers(&["1".to_string()]).unwrap();
        assert_eq!(picked[0].id, "1");
        // unknown id falls back to the nearest
        let picked = list.find_servers(&["999".to_string()]).unwrap();
        assert_eq!(picked[0].id, "2");

        let empty = ServerList::default();
        assert!(empty.find_servers(&[]).is_err());
    }

    #[test]
    fn suspicious_result_flag() {
        let mut server = Server::default();
        server.dl_rate = ByteRate(1_000_000.0);
        server.ul_rate = ByteRate(500_000.0);
        assert!(!server.looks_suspicious());

        server.dl_rate = ByteRate(100.0);
        server.ul_rate = ByteRate(1_000_000.0);
        assert!(server.looks_suspicious());

        server.dl_rate = ByteRate::NOT_AVAILABLE;
        assert!(!server.looks_suspicious());
    }

    #[test]
    fn report_uses_sentinels_when_unreachable() {
        let server = Server::default();
        let report = server.report();
        assert_eq!(report.latency_ns, -1);
        assert_eq!(report.jitter_ns, -1);
        assert!(report.packet_loss.is_none());
    }

    #[test]
    fn city_table_lookup() {
        assert!(city_coordinates("London").is_some());
        assert!(city_coordinates("atlantis").is_none());
        let mut user = User::default();
        assert!(user.set_location_by_city("paris"));
        assert_eq!(user.lat, "48.8600");
    }
}
