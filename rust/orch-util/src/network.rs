// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Networking helpers.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Best-effort discovery of the address other nodes can reach us on.
///
/// Connects a UDP socket (no packets are sent) and reads the chosen local
/// interface; falls back to loopback when there is no route.
pub fn get_local_ip() -> IpAddr {
    let local = UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
        socket.connect("8.8.8.8:53")?;
        socket.local_addr()
    });
    match local {
        Ok(addr) => addr.ip(),
        Err(e) => {
            tracing::debug!(error = %e, "falling back to loopback address");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Normalise a `host:port` string into a URI tonic can dial.
pub fn to_http_uri(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_http_uri() {
        assert_eq!(to_http_uri("127.0.0.1:5000"), "http://127.0.0.1:5000");
        assert_eq!(to_http_uri("http://host:1"), "http://host:1");
        assert_eq!(to_http_uri("https://host:1"), "https://host:1");
    }

    #[test]
    fn test_get_local_ip_is_not_unspecified() {
        assert!(!get_local_ip().is_unspecified());
    }
}
