use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Wall-clock time and durable-sleep primitive for orchestration.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        // Already-passed deadlines return immediately.
        if let Ok(remaining) = (deadline - Utc::now()).to_std() {
            tokio::time::sleep(remaining).await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn past_deadline_does_not_sleep() {
        let clock = SystemClock;
        let started = std::time::Instant::now();
        clock.sleep_until(Utc::now() - chrono::Duration::seconds(5)).await;
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }
}
