use mdns_responder::{Responder, ResponderConfig, ServiceOptions};

pub fn main() {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters("mdns_responder=debug");
    builder.init();

    let responder = Responder::with_config(ResponderConfig::default()).unwrap();
    let _web = responder.register(
        "_http._tcp".to_owned(),
        "Web Server".to_owned(),
        80,
        &["path=/"],
    );

    let printer = responder.register_service(
        ServiceOptions::new("_ipp._tcp", "Office Printer", 631)
            .with_subtype("universal")
            .with_txt(&["rp=ipp/print"]),
    );
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    match runtime.block_on(printer.publish()) {
        Ok(outcome) => log::info!("printer published: {:?}", outcome),
        Err(err) => log::error!("printer not published: {}", err),
    }

    loop {
        ::std::thread::sleep(::std::time::Duration::from_secs(10));
    }
}
