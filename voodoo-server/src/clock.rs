//! Demonstration service: a per-connection clock object.
//!
//! The factory method creates a `Clock`, publishes it and returns its id. Each
//! clock keeps its own offset from the host's UTC time of day.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use voodoo_core::{arg, method_tags, values, CodecError, FromValue, Host, HostError, Id, Value};
use voodoo_net::{publish, CallContext, Client, ClientError, Interface, Proxy};

const SECONDS_PER_DAY: i64 = 86_400;

method_tags! {
    pub enum ClockMethod {
        GetTime = 1,
        SetTime = 2,
    }
}

/// Wall-clock time of day, second resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay {
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl TimeOfDay {
    pub fn new(hours: u32, minutes: u32, seconds: u32) -> Option<Self> {
        (hours < 24 && minutes < 60 && seconds < 60).then_some(Self {
            hours,
            minutes,
            seconds,
        })
    }

    /// Wraps into a single day.
    pub fn from_seconds(total: i64) -> Self {
        let s = total.rem_euclid(SECONDS_PER_DAY) as u32;
        Self {
            hours: s / 3600,
            minutes: s / 60 % 60,
            seconds: s % 60,
        }
    }

    pub fn as_seconds(self) -> i64 {
        i64::from(self.hours) * 3600 + i64::from(self.minutes) * 60 + i64::from(self.seconds)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("expected HH:MM:SS, got {0:?}")]
pub struct ParseTimeError(String);

impl FromStr for TimeOfDay {
    type Err = ParseTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseTimeError(s.to_string());
        let mut parts = s.split(':').map(|p| p.trim().parse::<u32>());
        let (Some(Ok(h)), Some(Ok(m)), Some(Ok(sec)), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad());
        };
        Self::new(h, m, sec).ok_or_else(bad)
    }
}

fn host_seconds_of_day() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    since_epoch.rem_euclid(SECONDS_PER_DAY)
}

pub struct Clock {
    offset: AtomicI64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            offset: AtomicI64::new(0),
        }
    }

    fn now(&self) -> i64 {
        (host_seconds_of_day() + self.offset.load(Ordering::Relaxed)).rem_euclid(SECONDS_PER_DAY)
    }

    fn set(&self, time: TimeOfDay) {
        self.offset
            .store(time.as_seconds() - host_seconds_of_day(), Ordering::Relaxed);
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Interface for Clock {
    type Method = ClockMethod;

    fn call(
        &self,
        ctx: &CallContext,
        method: ClockMethod,
        args: &[Value],
    ) -> Result<Vec<Value>, HostError> {
        match method {
            ClockMethod::GetTime => Ok(values![self.now()]),
            ClockMethod::SetTime => {
                let h: u32 = arg(args, 1)?;
                let m: u32 = arg(args, 2)?;
                let s: u32 = arg(args, 3)?;
                let time = TimeOfDay::new(h, m, s)
                    .ok_or_else(|| HostError::Failed(format!("time {h}:{m}:{s} out of range")))?;
                self.set(time);
                tracing::debug!(conn = %ctx.connection(), %time, "clock set");
                Ok(vec![])
            }
        }
    }
}

/// Register the clock factory on `host`. Each call publishes a new clock owned
/// by the calling connection and returns its id.
pub fn register(host: &Arc<Host<CallContext>>) -> Result<Id, HostError> {
    let weak = Arc::downgrade(host);
    host.register(move |ctx, _args| {
        let host = weak
            .upgrade()
            .ok_or_else(|| HostError::Failed("server shutting down".into()))?;
        let id = publish(&host, ctx, Clock::new())?;
        tracing::info!(
            object = %id,
            conn = %ctx.connection(),
            peer = %ctx.peer_addr(),
            "clock created"
        );
        Ok(values![id])
    })
}

/// Client-side clock.
pub struct RemoteClock {
    proxy: Proxy,
}

impl RemoteClock {
    /// Ask the factory at `factory` for a new clock.
    pub async fn create(client: &Client, factory: Id) -> Result<Self, ClientError> {
        let out = client.call(factory, vec![]).await?;
        let id: Id = single(&out)?;
        Ok(Self {
            proxy: Proxy::new(client, id),
        })
    }

    pub fn id(&self) -> Id {
        self.proxy.id()
    }

    pub async fn time(&self) -> Result<TimeOfDay, ClientError> {
        let out = self.proxy.invoke(ClockMethod::GetTime, vec![]).await?;
        Ok(TimeOfDay::from_seconds(single(&out)?))
    }

    pub async fn set_time(&self, time: TimeOfDay) -> Result<(), ClientError> {
        self.proxy
            .invoke(
                ClockMethod::SetTime,
                values![time.hours, time.minutes, time.seconds],
            )
            .await?;
        Ok(())
    }
}

fn single<T: FromValue>(values: &[Value]) -> Result<T, ClientError> {
    match values {
        [v] => T::from_value(v).ok_or_else(|| {
            CodecError::MalformedReply(format!("expected {}, got {}", T::EXPECTED, v.type_name()))
                .into()
        }),
        other => {
            let message = format!("expected one value, got {}", other.len());
            Err(CodecError::MalformedReply(message).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voodoo_core::MethodTag;
    use voodoo_net::Server;

    #[test]
    fn parse_and_format() {
        let t: TimeOfDay = "07:05:09".parse().unwrap();
        assert_eq!(t, TimeOfDay::new(7, 5, 9).unwrap());
        assert_eq!(t.to_string(), "07:05:09");
        assert!("24:00:00".parse::<TimeOfDay>().is_err());
        assert!("12:00".parse::<TimeOfDay>().is_err());
        assert!("12:00:00:00".parse::<TimeOfDay>().is_err());
        assert!("aa:00:00".parse::<TimeOfDay>().is_err());
    }

    #[test]
    fn seconds_wrap_into_one_day() {
        assert_eq!(TimeOfDay::from_seconds(-1).to_string(), "23:59:59");
        assert_eq!(TimeOfDay::from_seconds(SECONDS_PER_DAY + 61).to_string(), "00:01:01");
        let t = TimeOfDay::new(13, 14, 15).unwrap();
        assert_eq!(TimeOfDay::from_seconds(t.as_seconds()), t);
    }

    #[tokio::test]
    async fn set_then_get_over_loopback() {
        let server = Arc::new(Server::new());
        let factory = register(server.host()).unwrap();
        let addr = server.listen_on("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let runner = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };

        let client = Client::new();
        client.connect("127.0.0.1", addr.port()).await.unwrap();
        let clock = RemoteClock::create(&client, factory).await.unwrap();
        let other = RemoteClock::create(&client, factory).await.unwrap();
        assert_ne!(clock.id(), other.id());

        clock.set_time(TimeOfDay::new(7, 0, 0).unwrap()).await.unwrap();
        let read = clock.time().await.unwrap().as_seconds();
        assert!((7 * 3600..7 * 3600 + 3).contains(&read), "read back {read}");

        let bad = client
            .call(clock.id(), values![ClockMethod::SetTime.tag(), 25u32, 0u32, 0u32])
            .await;
        assert!(matches!(bad, Err(ClientError::Fault(_))));

        drop(clock);
        drop(other);
        drop(client);
        server.stop();
        runner.await.unwrap().unwrap();
        server.join().await.unwrap();
        assert_eq!(server.host().interface_count(), 0);
    }
}
