use crate::config::Connection;
use crate::prelude::*;
use crate::register::{Register, RegisterKind};

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_modbus::client::{rtu, tcp, Context, Reader};
use tokio_modbus::Slave;
use tokio_serial::SerialPortBuilderExt;

struct Link {
    device: config::Device,
    ctx: Mutex<Context>,
}

/// Polls devices over Modbus TCP or RTU, one connection per device.
///
/// Connections are opened once, in `connect`. A device whose connection
/// fails there is logged and left out; it is not retried.
pub struct ModbusReader {
    links: Vec<Link>,
    read_timeout: Duration,
}

impl ModbusReader {
    pub async fn connect(devices: Vec<config::Device>, read_timeout: Duration) -> Self {
        let mut links = Vec::new();

        for device in devices {
            let Some(connection) = device.connection().cloned() else {
                warn!("device {} has no connection configured, skipping", device.id());
                continue;
            };

            match tokio::time::timeout(read_timeout, Self::open(&connection)).await {
                Ok(Ok(ctx)) => {
                    info!("device {} connected via {}", device.id(), connection);
                    links.push(Link {
                        device,
                        ctx: Mutex::new(ctx),
                    });
                }
                Ok(Err(err)) => {
                    warn!("device {}: cannot connect via {}: {}", device.id(), connection, err);
                }
                Err(_) => {
                    warn!(
                        "device {}: no connection via {} after {}s",
                        device.id(),
                        connection,
                        read_timeout.as_secs()
                    );
                }
            }
        }

        info!("{} device(s) connected", links.len());

        Self { links, read_timeout }
    }

    async fn open(connection: &Connection) -> Result<Context> {
        match connection {
            Connection::Tcp { host, port, unit_id } => {
                let addr = tokio::net::lookup_host((host.as_str(), *port))
                    .await?
                    .next()
                    .ok_or_else(|| anyhow!("{} did not resolve", host))?;
                Ok(tcp::connect_slave(addr, Slave(*unit_id)).await?)
            }
            Connection::Rtu { path, baud_rate, unit_id } => {
                let port = tokio_serial::new(path, *baud_rate).open_native_async()?;
                Ok(rtu::attach_slave(port, Slave(*unit_id)))
            }
        }
    }

    async fn read_words(&self, ctx: &mut Context, register: &Register) -> Result<Vec<u16>, String> {
        let count = register.width.words() as u16;
        let request = async {
            match register.kind {
                RegisterKind::Holding => ctx.read_holding_registers(register.address, count).await,
                RegisterKind::Input => ctx.read_input_registers(register.address, count).await,
            }
        };

        match tokio::time::timeout(self.read_timeout, request).await {
            Ok(Ok(Ok(words))) => Ok(words),
            Ok(Ok(Err(code))) => Err(format!("modbus exception {:?} at {}", code, register.address)),
            Ok(Err(err)) => Err(format!("transport error at {}: {}", register.address, err)),
            Err(_) => Err(format!(
                "no response for {} after {}s",
                register.address,
                self.read_timeout.as_secs()
            )),
        }
    }
}

#[async_trait]
impl DeviceReader for ModbusReader {
    fn devices(&self) -> Vec<config::Device> {
        self.links.iter().map(|l| l.device.clone()).collect()
    }

    async fn read_device(&self, id: &str) -> Result<DeviceReading> {
        let link = self
            .links
            .iter()
            .find(|l| l.device.id() == id)
            .ok_or_else(|| anyhow!("device {} has no live connection", id))?;

        let mut reading = DeviceReading::new(&link.device);
        let mut ctx = link.ctx.lock().await;

        for (field, register) in link.device.registers() {
            let words = self.read_words(&mut ctx, register).await;
            reading.push_words(field, register, words);
        }

        if reading.field_errors() > 0 {
            warn!(
                "device {}: {} of {} fields failed",
                id,
                reading.field_errors(),
                reading.fields.len()
            );
        }

        Ok(reading)
    }
}
