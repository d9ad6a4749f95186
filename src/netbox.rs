use log::debug;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::NetboxConfig;
use crate::diff::{InterfaceCreate, InterfaceUpdate};
use crate::store::{DeviceHandle, InventoryStore, StoreError, StoreInterface};

/// One page of a NetBox list endpoint.
#[derive(Deserialize, Debug)]
struct Page<T> {
    results: Vec<T>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Deserialize, Debug)]
struct DeviceSummary {
    id: u64,
}

/// NetBox REST client (blocking).
pub struct NetboxClient {
    http: Client,
    api_base: String,
    token: String,
    page_size: u32,
}

impl NetboxClient {
    pub fn new(config: &NetboxConfig) -> Result<Self, StoreError> {
        let http = Client::builder()
            .user_agent(format!("nbi/{}", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout())
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;

        Ok(NetboxClient {
            http,
            api_base: format!("{}/api", config.address.trim().trim_end_matches('/')),
            token: config.token.clone(),
            page_size: config.page_size,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(ACCEPT, "application/json")
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        check_status(self.authorized(request).send()?)
    }

    fn get_page<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Page<T>, StoreError> {
        Ok(self.send(request)?.json()?)
    }

    fn interfaces_url(&self) -> String {
        format!("{}/dcim/interfaces/", self.api_base)
    }
}

fn check_status(response: Response) -> Result<Response, StoreError> {
    let status = response.status().as_u16();
    if response.status().is_success() {
        return Ok(response);
    }

    let body = response.text().unwrap_or_default();
    if status == 400 || status == 422 {
        return Err(StoreError::Conflict(body));
    }
    Err(StoreError::Http { status, body })
}

/// Resolve a device lookup page: no match is `None`, several are ambiguous.
fn single_device(hostname: &str, page: Page<DeviceSummary>) -> Result<Option<DeviceHandle>, StoreError> {
    match page.results.as_slice() {
        [] => Ok(None),
        [device] => Ok(Some(DeviceHandle(device.id))),
        _ => Err(StoreError::Ambiguous(hostname.to_string())),
    }
}

impl InventoryStore for NetboxClient {
    fn find_device(&self, hostname: &str) -> Result<Option<DeviceHandle>, StoreError> {
        let url = format!("{}/dcim/devices/", self.api_base);
        let page = self.get_page(self.http.get(url).query(&[("name", hostname)]))?;

        single_device(hostname, page)
    }

    fn list_interfaces(&self, device: DeviceHandle) -> Result<Vec<StoreInterface>, StoreError> {
        let first = self.http.get(self.interfaces_url()).query(&[
            ("device_id", device.0.to_string()),
            ("limit", self.page_size.to_string()),
        ]);

        let mut page: Page<StoreInterface> = self.get_page(first)?;
        let mut interfaces = std::mem::take(&mut page.results);
        while let Some(next) = page.next.take() {
            debug!("Fetching {next}");
            page = self.get_page(self.http.get(next))?;
            interfaces.append(&mut page.results);
        }

        Ok(interfaces)
    }

    fn create_interface(&self, interface: &InterfaceCreate) -> Result<(), StoreError> {
        self.send(self.http.post(self.interfaces_url()).json(interface))?;
        Ok(())
    }

    fn update_interface(&self, interface: &InterfaceUpdate) -> Result<(), StoreError> {
        let url = format!("{}{}/", self.interfaces_url(), interface.id);
        self.send(self.http.patch(url).json(interface))?;
        Ok(())
    }
}
