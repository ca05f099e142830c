//! A multicast DNS responder advertising DNS-SD services on the local link
//!
//! Services are probed for name conflicts before they are announced, answer
//! queries while published and say goodbye when they are unpublished or
//! dropped.
//!
//! ```no_run
//! let responder = mdns_responder::Responder::new().unwrap();
//! let _svc = responder.register(
//!     "_http._tcp".to_owned(),
//!     "Web Server".to_owned(),
//!     80,
//!     &["path=/"],
//! );
//! ```

use futures_util::FutureExt;
use log::{debug, warn};
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

mod address_family;
pub mod dns_parser;
mod error;
mod fsm;
mod network;
mod responder;
mod services;

use crate::fsm::{Command, FSM};
use crate::network::NetworkManager;
use crate::responder::ServiceId;
use crate::services::ServiceData;

pub use crate::error::Error;
pub use crate::responder::{ProbeOutcome, PublishOutcome, DEFAULT_UDP_PAYLOAD_SIZE, MDNS_PORT};
pub use crate::services::ServiceState;

const DEFAULT_NETWORK_POLL_INTERVAL: Duration = Duration::from_secs(15);

static NEXT_SERVICE_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// defaults to the system host name in the `.local` domain
    pub hostname: Option<String>,
    /// only these addresses are advertised, empty means all of them
    pub allowed_ips: Vec<IpAddr>,
    /// only these interfaces are used, empty means all of them
    pub interfaces: Vec<String>,
    pub disable_ipv6: bool,
    /// how often the interface list is checked for changes
    pub network_poll_interval: Duration,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        ResponderConfig {
            hostname: None,
            allowed_ips: Vec::new(),
            interfaces: Vec::new(),
            disable_ipv6: false,
            network_poll_interval: DEFAULT_NETWORK_POLL_INTERVAL,
        }
    }
}

/// Everything that describes a service instance
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub name: String,
    /// e.g. `_http._tcp`
    pub service_type: String,
    /// e.g. `printer` or `_printer`
    pub subtypes: Vec<String>,
    pub domain: String,
    /// overrides the responder's host name
    pub hostname: Option<String>,
    pub port: u16,
    pub txt: Vec<Vec<u8>>,
}

impl ServiceOptions {
    pub fn new(service_type: &str, name: &str, port: u16) -> ServiceOptions {
        ServiceOptions {
            name: name.to_owned(),
            service_type: service_type.to_owned(),
            subtypes: Vec::new(),
            domain: "local".to_owned(),
            hostname: None,
            port,
            txt: Vec::new(),
        }
    }

    pub fn with_txt(mut self, txt: &[&str]) -> ServiceOptions {
        self.txt = txt_entries(txt);
        self
    }

    pub fn with_subtype(mut self, subtype: &str) -> ServiceOptions {
        self.subtypes.push(subtype.to_owned());
        self
    }
}

fn txt_entries(txt: &[&str]) -> Vec<Vec<u8>> {
    txt.iter().map(|entry| entry.as_bytes().to_vec()).collect()
}

fn local_hostname() -> io::Result<String> {
    let hostname = hostname::get()?
        .into_string()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "host name is not UTF-8"))?;
    Ok(hostname)
}

fn with_local_suffix(mut hostname: String) -> String {
    if !hostname.ends_with(".local") {
        hostname.push_str(".local");
    }
    hostname
}

#[derive(Clone)]
struct CommandSender(mpsc::UnboundedSender<Command>);

impl CommandSender {
    fn send(&self, cmd: Command) {
        if self.0.send(cmd).is_err() {
            debug!("responder task is gone, dropping command");
        }
    }
}

struct Shutdown(CommandSender);

impl Drop for Shutdown {
    fn drop(&mut self) {
        self.0.send(Command::Shutdown);
    }
}

/// A running mDNS responder
///
/// Dropping the responder and all of its services sends goodbye packets
/// for everything still published and stops the responder task.
pub struct Responder {
    hostname: String,
    commands: CommandSender,
    shutdown: Arc<Shutdown>,
}

/// A registered service, unregistered when dropped
pub struct Service {
    id: ServiceId,
    commands: CommandSender,
    _shutdown: Arc<Shutdown>,
}

impl Responder {
    /// Starts a responder on its own thread and runtime
    pub fn new() -> io::Result<Responder> {
        Responder::with_config(ResponderConfig::default())
    }

    /// Like `new`, advertising only the given addresses
    pub fn new_with_ip_list(allowed_ips: Vec<IpAddr>) -> io::Result<Responder> {
        Responder::with_config(ResponderConfig {
            allowed_ips,
            ..ResponderConfig::default()
        })
    }

    pub fn with_config(config: ResponderConfig) -> io::Result<Responder> {
        let (tx, rx) = std_mpsc::sync_channel(0);
        thread::Builder::new()
            .name("mdns-responder".to_owned())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                };
                rt.block_on(async {
                    match Responder::setup(config) {
                        Ok((responder, task)) => {
                            if tx.send(Ok(responder)).is_ok() {
                                task.await;
                            }
                        }
                        Err(err) => {
                            let _ = tx.send(Err(err));
                        }
                    }
                });
            })?;

        rx.recv().map_err(|_| {
            io::Error::new(io::ErrorKind::Other, "responder thread exited during setup")
        })?
    }

    /// Spawns a responder task onto an existing runtime
    pub fn spawn(handle: &Handle) -> io::Result<Responder> {
        Responder::spawn_with_config(handle, ResponderConfig::default())
    }

    pub fn spawn_with_config(handle: &Handle, config: ResponderConfig) -> io::Result<Responder> {
        let (responder, task) = {
            let _guard = handle.enter();
            Responder::setup(config)?
        };
        handle.spawn(task);
        Ok(responder)
    }

    /// Spawns a responder task onto the runtime of the caller
    ///
    /// Panics outside of a tokio runtime.
    pub fn with_default_handle() -> io::Result<Responder> {
        Responder::spawn(&Handle::current())
    }

    // Will panic if called from outside the context of a runtime
    fn setup(config: ResponderConfig) -> io::Result<(Responder, impl Future<Output = ()>)> {
        let hostname = match config.hostname {
            Some(hostname) => hostname,
            None => local_hostname()?,
        };
        let hostname = with_local_suffix(hostname);

        let network =
            NetworkManager::new(config.interfaces, config.allowed_ips, config.disable_ipv6)?;
        if network.interfaces().is_empty() {
            warn!("no usable network interfaces found");
        }
        let (fsm, tx) = FSM::new(network, config.disable_ipv6, config.network_poll_interval)?;
        let commands = CommandSender(tx);

        let responder = Responder {
            hostname,
            commands: commands.clone(),
            shutdown: Arc::new(Shutdown(commands)),
        };
        Ok((responder, fsm.run()))
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Registers a service and starts publishing it right away
    ///
    /// Panics if a TXT entry is longer than 255 bytes.
    pub fn register(&self, svc_type: String, svc_name: String, port: u16, txt: &[&str]) -> Service {
        let options = ServiceOptions::new(&svc_type, &svc_name, port).with_txt(txt);
        let service = self.register_service(options);
        drop(service.publish());
        service
    }

    /// Registers a service without publishing it
    ///
    /// Panics if a TXT entry is longer than 255 bytes.
    pub fn register_service(&self, options: ServiceOptions) -> Service {
        let hostname = options.hostname.unwrap_or_else(|| self.hostname.clone());
        let data = ServiceData::new(
            &options.name,
            &options.service_type,
            &options.domain,
            &options.subtypes,
            &hostname,
            options.port,
            options.txt,
        );

        let id = NEXT_SERVICE_ID.fetch_add(1, Ordering::Relaxed);
        self.commands.send(Command::Register { id, data });

        Service {
            id,
            commands: self.commands.clone(),
            _shutdown: self.shutdown.clone(),
        }
    }
}

fn completion<T>(
    rx: oneshot::Receiver<Result<T, Error>>,
) -> impl Future<Output = Result<T, Error>> {
    rx.map(|result| result.unwrap_or(Err(Error::Shutdown)))
}

impl Service {
    /// Probes for the service's names and announces it
    ///
    /// Fails with `Error::Conflict` if another host owns one of the names.
    pub fn publish(&self) -> impl Future<Output = Result<PublishOutcome, Error>> {
        let (done, rx) = oneshot::channel();
        self.commands.send(Command::Publish { id: self.id, done });
        completion(rx)
    }

    /// Stops announcing and sends a goodbye if the service was announced
    pub fn unpublish(&self) -> impl Future<Output = Result<(), Error>> {
        let (done, rx) = oneshot::channel();
        self.commands.send(Command::Unpublish { id: self.id, done });
        completion(rx)
    }

    /// Withdraws an announced service and publishes it again
    ///
    /// The names are probed anew before the service is announced.
    pub fn republish(&self) -> impl Future<Output = Result<PublishOutcome, Error>> {
        let (done, rx) = oneshot::channel();
        self.commands.send(Command::Republish { id: self.id, done });
        completion(rx)
    }

    /// Replaces the TXT record
    ///
    /// Panics if an entry is longer than 255 bytes.
    pub fn update_txt(&self, txt: &[&str]) -> impl Future<Output = Result<(), Error>> {
        let txt = txt_entries(txt);
        assert!(
            txt.iter().all(|entry| entry.len() <= 255),
            "TXT entry is too long"
        );
        let (done, rx) = oneshot::channel();
        self.commands.send(Command::UpdateTxt {
            id: self.id,
            txt,
            done,
        });
        completion(rx)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.commands.send(Command::Unregister { id: self.id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_gets_local_suffix() {
        assert_eq!(with_local_suffix("myhost".to_owned()), "myhost.local");
        assert_eq!(with_local_suffix("myhost.local".to_owned()), "myhost.local");
    }

    #[test]
    fn service_options() {
        let options = ServiceOptions::new("_http._tcp", "Web Server", 80)
            .with_txt(&["path=/", "v=1"])
            .with_subtype("printer");
        assert_eq!(options.domain, "local");
        assert_eq!(options.txt, vec![b"path=/".to_vec(), b"v=1".to_vec()]);
        assert_eq!(options.subtypes, vec!["printer".to_owned()]);
    }

    #[tokio::test]
    async fn dropped_completion_reports_shutdown() {
        let (done, rx) = oneshot::channel::<Result<(), Error>>();
        drop(done);
        assert!(matches!(completion(rx).await, Err(Error::Shutdown)));
    }
}
