use crate::dns_parser::{dns_lower_case, escape_label, RRData, ResourceRecord, Type};
use crate::network::NetworkInterface;
use multimap::MultiMap;
use std::net::IpAddr;

pub const SERVICE_TYPE_ENUMERATION_NAME: &str = "_services._dns-sd._udp.local";

/// TTL for records that are not tied to a host name (RFC 6762 10)
pub const DEFAULT_TTL: u32 = 4500;
/// TTL for records containing a host name
pub const HOST_TTL: u32 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Unannounced,
    Probing,
    Probed,
    Announcing,
    Announced,
}

#[derive(Clone, Debug)]
pub struct ServiceData {
    /// instance name, e.g. `Printer`
    pub name: String,
    /// service type without domain, e.g. `_http._tcp`
    pub typ: String,
    pub domain: String,
    /// sub-type labels, e.g. `_printer`
    pub subtypes: Vec<String>,
    /// fully qualified host name the SRV record points to
    pub hostname: String,
    pub port: u16,
    pub txt: Vec<Vec<u8>>,
}

/// Record builders used by the responder to answer for a `ServiceData`
impl ServiceData {
    pub fn new(
        name: &str,
        typ: &str,
        domain: &str,
        subtypes: &[String],
        hostname: &str,
        port: u16,
        txt: Vec<Vec<u8>>,
    ) -> ServiceData {
        let domain = domain.trim_matches('.');
        let hostname = hostname.trim_end_matches('.');
        let hostname = if hostname.ends_with(&format!(".{}", domain)) {
            hostname.to_owned()
        } else {
            format!("{}.{}", hostname, domain)
        };

        ServiceData {
            name: name.to_owned(),
            typ: typ.trim_matches('.').to_owned(),
            domain: domain.to_owned(),
            subtypes: subtypes
                .iter()
                .map(|sub| {
                    if sub.starts_with('_') {
                        sub.clone()
                    } else {
                        format!("_{}", sub)
                    }
                })
                .collect(),
            hostname,
            port,
            txt: normalize_txt(txt),
        }
    }

    pub fn set_txt(&mut self, txt: Vec<Vec<u8>>) {
        self.txt = normalize_txt(txt);
    }

    /// `Printer` becomes `Printer (2)`, `Printer (2)` becomes `Printer (3)`
    pub fn increment_name(&mut self) {
        let (base, number) = split_counter(&self.name, " (", ")");
        self.name = format!("{} ({})", base, number + 1);
    }

    /// `host.local` becomes `host-2.local`, `host-2.local` becomes `host-3.local`
    pub fn increment_hostname(&mut self) {
        let suffix = format!(".{}", self.domain);
        let host = self.hostname.strip_suffix(&suffix).unwrap_or(&self.hostname);
        let (base, number) = split_counter(host, "-", "");
        self.hostname = format!("{}-{}{}", base, number + 1, suffix);
    }

    /// `<instance>.<type>.<domain>`, dots inside the instance name are escaped
    pub fn fqdn(&self) -> String {
        format!("{}.{}.{}", escape_label(&self.name), self.typ, self.domain)
    }

    /// `<type>.<domain>`
    pub fn type_ptr(&self) -> String {
        format!("{}.{}", self.typ, self.domain)
    }

    /// `<sub>._sub.<type>.<domain>` for every sub-type
    pub fn subtype_ptrs(&self) -> Vec<String> {
        self.subtypes
            .iter()
            .map(|sub| format!("{}._sub.{}.{}", sub, self.typ, self.domain))
            .collect()
    }

    /// Every name that should be answered by the pointer table with this service
    pub fn pointer_names(&self) -> Vec<String> {
        let mut names = vec![self.type_ptr()];
        names.extend(self.subtype_ptrs());
        names
    }

    pub fn ptr_record(&self) -> ResourceRecord {
        ResourceRecord::new(self.type_ptr(), DEFAULT_TTL, false, RRData::PTR(self.fqdn()))
    }

    pub fn subtype_ptr_records(&self) -> Vec<ResourceRecord> {
        self.subtype_ptrs()
            .into_iter()
            .map(|name| ResourceRecord::new(name, DEFAULT_TTL, false, RRData::PTR(self.fqdn())))
            .collect()
    }

    /// https://www.rfc-editor.org/rfc/rfc6763#section-9
    pub fn service_enumeration_record(&self) -> ResourceRecord {
        ResourceRecord::new(
            SERVICE_TYPE_ENUMERATION_NAME,
            DEFAULT_TTL,
            false,
            RRData::PTR(self.type_ptr()),
        )
    }

    pub fn srv_record(&self) -> ResourceRecord {
        ResourceRecord::new(
            self.fqdn(),
            HOST_TTL,
            true,
            RRData::SRV {
                priority: 0,
                weight: 0,
                port: self.port,
                target: self.hostname.clone(),
            },
        )
    }

    pub fn txt_record(&self) -> ResourceRecord {
        ResourceRecord::new(self.fqdn(), DEFAULT_TTL, true, RRData::TXT(self.txt.clone()))
    }

    pub fn a_record(&self, iface: &NetworkInterface) -> Option<ResourceRecord> {
        iface
            .ipv4
            .map(|ip| ResourceRecord::new(self.hostname.clone(), HOST_TTL, true, RRData::A(ip)))
    }

    pub fn aaaa_record(&self, iface: &NetworkInterface) -> Option<ResourceRecord> {
        iface
            .ipv6
            .map(|ip| ResourceRecord::new(self.hostname.clone(), HOST_TTL, true, RRData::AAAA(ip)))
    }

    pub fn aaaa_routable_record(&self, iface: &NetworkInterface) -> Option<ResourceRecord> {
        iface
            .routable_ipv6
            .map(|ip| ResourceRecord::new(self.hostname.clone(), HOST_TTL, true, RRData::AAAA(ip)))
    }

    pub fn address_records(&self, iface: &NetworkInterface) -> Vec<ResourceRecord> {
        self.a_record(iface)
            .into_iter()
            .chain(self.aaaa_record(iface))
            .chain(self.aaaa_routable_record(iface))
            .collect()
    }

    /// Record for a single address, used when advertising address changes
    pub fn address_record(&self, ip: IpAddr, ttl: u32) -> ResourceRecord {
        let data = match ip {
            IpAddr::V4(ip) => RRData::A(ip),
            IpAddr::V6(ip) => RRData::AAAA(ip),
        };
        ResourceRecord::new(self.hostname.clone(), ttl, true, data)
    }

    /// Asserts which address types exist for the host name on `iface`
    pub fn nsec_record(&self, iface: &NetworkInterface) -> ResourceRecord {
        let mut types = Vec::new();
        if iface.ipv4.is_some() {
            types.push(Type::A);
        }
        if iface.ipv6.is_some() || iface.routable_ipv6.is_some() {
            types.push(Type::AAAA);
        }
        ResourceRecord::new(
            self.hostname.clone(),
            HOST_TTL,
            true,
            RRData::NSEC {
                next_domain: self.hostname.clone(),
                types,
            },
        )
    }

    /// The records asserted unique by this service, as sent in a probe
    pub fn probe_records(&self, iface: &NetworkInterface) -> Vec<ResourceRecord> {
        let mut records = vec![self.srv_record(), self.txt_record()];
        records.extend(self.address_records(iface));
        records
    }

    /// Full record set of an announcement on `iface`
    pub fn announce_records(&self, iface: &NetworkInterface) -> Vec<ResourceRecord> {
        let mut records = vec![self.ptr_record()];
        records.extend(self.subtype_ptr_records());
        records.push(self.srv_record());
        records.push(self.txt_record());
        records.extend(self.address_records(iface));
        records.push(self.service_enumeration_record());
        records
    }

    /// Records withdrawn by a goodbye
    ///
    /// Address records stay: other services may share the host name and
    /// RFC 6762 10.1 only asks to withdraw records that stop being valid.
    /// The enumeration PTR stays too, it is shared by every service of the
    /// same type.
    pub fn goodbye_records(&self) -> Vec<ResourceRecord> {
        let mut records = vec![self.ptr_record()];
        records.extend(self.subtype_ptr_records());
        records.push(self.srv_record());
        records.push(self.txt_record());
        for record in &mut records {
            record.ttl = 0;
        }
        records
    }

    pub fn has_address<'a, I>(&self, ip: &IpAddr, interfaces: I) -> bool
    where
        I: IntoIterator<Item = &'a NetworkInterface>,
    {
        interfaces.into_iter().any(|iface| iface.has_address(ip))
    }
}

/// Splits `name` into its base and a trailing counter, 1 if there is none
fn split_counter<'a>(name: &'a str, open: &str, close: &str) -> (&'a str, u32) {
    let counted = name.strip_suffix(close).and_then(|rest| {
        let start = rest.rfind(open)?;
        let number = rest[start + open.len()..].parse::<u32>().ok()?;
        Some((&name[..start], number))
    });
    counted.filter(|&(_, n)| n > 1).unwrap_or((name, 1))
}

fn normalize_txt(txt: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    for entry in &txt {
        assert!(
            entry.len() <= 255,
            "{:?} is too long for a TXT record",
            entry
        );
    }
    if txt.is_empty() {
        vec![vec![]]
    } else {
        txt
    }
}

/// Maps lower cased PTR names to the fully qualified names of announced services
#[derive(Debug, Default)]
pub struct ServicePointers {
    pointers: MultiMap<String, String>,
}

impl ServicePointers {
    pub fn new() -> Self {
        ServicePointers {
            pointers: MultiMap::new(),
        }
    }

    /// Adds all pointers of `svc`, returns false if they were already present
    pub fn add(&mut self, svc: &ServiceData) -> bool {
        let fqdn = svc.fqdn();
        let mut added = false;

        let type_ptr = dns_lower_case(&svc.type_ptr());
        let enumeration = SERVICE_TYPE_ENUMERATION_NAME.to_owned();
        if !self.contains(&enumeration, &type_ptr) {
            self.pointers.insert(enumeration, svc.type_ptr());
        }

        for name in svc.pointer_names() {
            let key = dns_lower_case(&name);
            if !self.contains(&key, &fqdn) {
                self.pointers.insert(key, fqdn.clone());
                added = true;
            }
        }
        added
    }

    pub fn remove(&mut self, svc: &ServiceData) {
        let fqdn = dns_lower_case(&svc.fqdn());
        for name in svc.pointer_names() {
            let key = dns_lower_case(&name);
            let empty = match self.pointers.get_vec_mut(&key) {
                Some(targets) => {
                    targets.retain(|target| dns_lower_case(target) != fqdn);
                    targets.is_empty()
                }
                None => false,
            };
            if empty {
                self.pointers.remove(&key);
            }
        }

        // drop the type from the enumeration once no service of it is left
        let type_key = dns_lower_case(&svc.type_ptr());
        if !self.pointers.contains_key(&type_key) {
            let empty = match self.pointers.get_vec_mut(SERVICE_TYPE_ENUMERATION_NAME) {
                Some(types) => {
                    types.retain(|typ| dns_lower_case(typ) != type_key);
                    types.is_empty()
                }
                None => false,
            };
            if empty {
                self.pointers.remove(SERVICE_TYPE_ENUMERATION_NAME);
            }
        }
    }

    pub fn get(&self, name: &str) -> &[String] {
        self.pointers
            .get_vec(&dns_lower_case(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_enumeration(name: &str) -> bool {
        dns_lower_case(name) == SERVICE_TYPE_ENUMERATION_NAME
    }

    fn contains(&self, key: &str, target: &str) -> bool {
        let target = dns_lower_case(target);
        self.pointers
            .get_vec(key)
            .map_or(false, |targets| {
                targets.iter().any(|t| dns_lower_case(t) == target)
            })
    }
}
