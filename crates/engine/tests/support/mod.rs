//! Shared fixtures: a mock UDP emulator speaking the command dialect and a
//! small game mapping exercising most property kinds.
use engine::Mapping;
use engine::mapping::{
    CharMap, ComputedNode, Endianness, Group, Platform, Property, PropertyKind, Region,
};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;

/// 64 KiB of fake guest RAM behind the datagram command protocol.
pub struct MockEmulator {
    socket: UdpSocket,
    ram: Arc<Mutex<Vec<u8>>>,
}

impl MockEmulator {
    /// Binds on an ephemeral port and serves until the test ends.
    pub async fn start() -> (SocketAddr, Arc<Mutex<Vec<u8>>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let ram = Arc::new(Mutex::new(vec![0u8; 0x10000]));
        let emulator = Self {
            socket,
            ram: ram.clone(),
        };
        tokio::spawn(emulator.serve());
        (addr, ram)
    }

    fn parse_addr(token: &str) -> usize {
        match token.parse::<u32>() {
            Ok(v) if v <= 9 => v as usize,
            _ => u32::from_str_radix(token, 16).unwrap() as usize,
        }
    }

    async fn serve(self) {
        let mut buf = vec![0u8; 65536];
        loop {
            let Ok((n, peer)) = self.socket.recv_from(&mut buf).await else {
                return;
            };
            let text = String::from_utf8_lossy(&buf[..n]).to_string();
            for line in text.lines() {
                let tokens: Vec<&str> = line.split_whitespace().collect();
                let reply = match tokens.as_slice() {
                    ["VERSION"] => "1.19.1\n".to_string(),
                    ["READ_CORE_MEMORY", addr_token, len] => {
                        let addr = Self::parse_addr(addr_token);
                        let len: usize = len.parse().unwrap();
                        let ram = self.ram.lock().unwrap();
                        let mut reply = format!("READ_CORE_MEMORY {}", addr_token);
                        for b in &ram[addr..addr + len] {
                            reply.push_str(&format!(" {:02x}", b));
                        }
                        reply.push('\n');
                        reply
                    }
                    ["WRITE_CORE_MEMORY", addr_token, rest @ ..] => {
                        let addr = Self::parse_addr(addr_token);
                        let mut ram = self.ram.lock().unwrap();
                        for (i, token) in rest.iter().enumerate() {
                            ram[addr + i] = u8::from_str_radix(token, 16).unwrap();
                        }
                        format!("WRITE_CORE_MEMORY {} {}\n", addr_token, rest.len())
                    }
                    _ => continue,
                };
                let _ = self.socket.send_to(reply.as_bytes(), peer).await;
            }
        }
    }
}

fn property(kind: PropertyKind, address: u32, width: usize) -> Property {
    Property {
        kind,
        address,
        width,
        endian: None,
        read_only: false,
        freezable: false,
        default_frozen: false,
        transforms: Vec::new(),
        validation: None,
        depends_on: Vec::new(),
        description: None,
        hints: None,
    }
}

/// A small mapping over three regions with primitive, BCD, char-mapped and
/// computed entries.
pub fn test_mapping() -> Mapping {
    let mut properties = BTreeMap::new();
    let mut lives = property(PropertyKind::U8, 0x0030, 1);
    lives.freezable = true;
    properties.insert("lives".to_string(), lives);

    properties.insert("score".to_string(), property(PropertyKind::U16, 0xC000, 2));

    let mut hp = property(PropertyKind::U16, 0xC100, 2);
    hp.freezable = true;
    properties.insert("hp".to_string(), hp);

    let mut locked = property(PropertyKind::U8, 0xC200, 1);
    locked.read_only = true;
    properties.insert("locked".to_string(), locked);

    properties.insert(
        "money".to_string(),
        property(PropertyKind::Bcd { length: 3 }, 0xD347, 3),
    );

    properties.insert(
        "name".to_string(),
        property(
            PropertyKind::String {
                length: 11,
                charmap: Some("pokemon".to_string()),
            },
            0xD158,
            11,
        ),
    );

    let mut computed = BTreeMap::new();
    computed.insert(
        "hp_half".to_string(),
        ComputedNode {
            expression: "hp / 2".to_string(),
            dependencies: vec!["hp".to_string()],
            kind: None,
            cached: false,
        },
    );

    let mut groups = BTreeMap::new();
    groups.insert(
        "player".to_string(),
        Group {
            properties: vec!["hp".to_string(), "lives".to_string()],
            display_name: Some("Player".to_string()),
            display: None,
        },
    );

    let mut charmaps = HashMap::new();
    charmaps.insert(
        "pokemon".to_string(),
        CharMap {
            map: HashMap::from([
                (0x50, " ".to_string()),
                (0x80, "A".to_string()),
                (0x84, "E".to_string()),
                (0x91, "R".to_string()),
            ]),
            terminators: vec![0x50, 0xFF],
        },
    );

    Mapping {
        name: "red-blue".to_string(),
        game: "Pokemon Red/Blue".to_string(),
        version: "1.0".to_string(),
        platform: Platform {
            name: "gb".to_string(),
            endian: Endianness::Little,
            regions: vec![
                Region {
                    name: "sys".to_string(),
                    start: 0x0000,
                    end: 0x07FF,
                },
                Region {
                    name: "wram1".to_string(),
                    start: 0xC000,
                    end: 0xC3FF,
                },
                Region {
                    name: "wram2".to_string(),
                    start: 0xD000,
                    end: 0xD3FF,
                },
            ],
        },
        constants: HashMap::new(),
        charmaps,
        properties,
        groups,
        computed,
        references: HashMap::new(),
        events: None,
        validation: Default::default(),
    }
}
