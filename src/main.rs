use std::{net::SocketAddr, process::ExitCode, time::Duration};

use clap::Parser;
use log::{error, info};
use rand::{rngs::StdRng, SeedableRng};

use stunstamp::{
    configuration::Configuration,
    conn::ProbeSocket,
    measure::measure_rtt,
    probe::{support_info, Protocol},
};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let conf = Configuration::parse();
    if let Err(e) = conf.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let dst = SocketAddr::new(conf.remote_addr, conf.remote_port);
    let timeout = Duration::from_millis(conf.timeout_ms);
    let interval = Duration::from_millis(conf.interval_ms);
    let support = support_info(conf.protocol);
    let hostname = conf.hostname.clone().unwrap_or_default();
    let mut rng = StdRng::from_entropy();

    info!(
        "probing {} over {} with {} timestamps",
        dst, conf.protocol, conf.source
    );

    let mut conn: Option<ProbeSocket> = None;
    let mut failures = 0u32;

    for i in 0..conf.count {
        if i > 0 {
            tokio::time::sleep(interval).await;
        }

        // An unstable connection must not accumulate stale in-flight replies
        // across probes; reopen it every time.
        if !support.stable_conn {
            conn = None;
        }
        if conn.is_none() {
            conn = match conf.protocol {
                Protocol::Stun => match ProbeSocket::udp(conf.remote_addr, conf.source) {
                    Ok(c) => Some(c),
                    Err(e) => {
                        error!("probe setup failed: {}", e);
                        failures += 1;
                        continue;
                    }
                },
                Protocol::Icmp => match ProbeSocket::icmp(conf.remote_addr, conf.source) {
                    Ok(c) => Some(c),
                    Err(e) => {
                        error!("probe setup failed: {}", e);
                        failures += 1;
                        continue;
                    }
                },
                // TCP and HTTPS establish their own connections.
                Protocol::Tcp | Protocol::Https => None,
            };
        }

        match measure_rtt(
            conf.protocol,
            conf.source,
            conn.as_ref(),
            &hostname,
            dst,
            timeout,
            &mut rng,
        )
        .await
        {
            Ok(rtt) => println!("{}: seq={} rtt={:?}", dst, i, rtt),
            Err(e) => {
                error!("probe {} to {} failed: {}", i, dst, e);
                failures += 1;
            }
        }
    }

    if conf.count > 0 && failures == conf.count {
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
