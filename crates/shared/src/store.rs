//! 键值存储抽象
//!
//! 分发引擎对持久层的全部依赖收敛为一个 `KeyStore` trait：
//! 带 TTL 的键值读写、原子自增/过期、有序集合、哈希自增和列表操作。
//! 生产环境由 `RedisStore` 实现；测试与本地开发使用 `MemoryStore`，
//! 两者行为一致，组件通过注入的 `Store` 句柄访问，不感知具体实现。
//!
//! 所有共享可变状态（限流计数、统计、队列）都通过单 key 的原子操作
//! 修改，不需要跨 key 加锁。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::{Serialize, de::DeserializeOwned};
use tracing::info;

use crate::config::RedisConfig;
use crate::error::{NotifyError, Result};

// ---------------------------------------------------------------------------
// KeyStore trait — 持久层契约
// ---------------------------------------------------------------------------

/// 持久层契约
///
/// 方法集合即分发引擎需要的全部存储能力，新增实现（如集群模式、
/// 本地嵌入式存储）只需覆盖这些原子操作。
#[async_trait]
pub trait KeyStore: Send + Sync {
    // ---- 键值 ----
    async fn get_raw(&self, key: &str) -> Result<Option<String>>;
    async fn set_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    // ---- 原子计数与过期 ----
    async fn incr(&self, key: &str, delta: i64) -> Result<i64>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    // ---- 有序集合（滑动窗口、延迟队列、投递日志） ----
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zcard(&self, key: &str) -> Result<u64>;
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;
    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn zrem(&self, key: &str, member: &str) -> Result<()>;
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64>;

    // ---- 哈希（分维度计数器） ----
    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    // ---- 列表（工作队列、活动流） ----
    async fn lpush(&self, key: &str, value: &str) -> Result<u64>;
    async fn rpop(&self, key: &str) -> Result<Option<String>>;
    async fn llen(&self, key: &str) -> Result<u64>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()>;
    async fn lrem(&self, key: &str, value: &str) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// Store — 注入用句柄
// ---------------------------------------------------------------------------

/// 存储句柄
///
/// 按引用共享的轻量句柄，生命周期与服务实例绑定。
/// 在裸操作之上提供 serde 序列化的类型化读写。
#[derive(Clone)]
pub struct Store {
    inner: Arc<dyn KeyStore>,
}

impl Store {
    pub fn new(inner: Arc<dyn KeyStore>) -> Self {
        Self { inner }
    }

    /// 创建基于 Redis 的存储句柄
    pub fn redis(config: &RedisConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(RedisStore::new(config)?)))
    }

    /// 创建内存存储句柄（测试与本地开发）
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// 获取值并反序列化
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.inner.get_raw(key).await? {
            Some(raw) => {
                let parsed: T = serde_json::from_str(&raw)
                    .map_err(|e| NotifyError::Serialization(e.to_string()))?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    /// 序列化并写入值
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let serialized =
            serde_json::to_string(value).map_err(|e| NotifyError::Serialization(e.to_string()))?;
        self.inner.set_raw(key, &serialized, ttl).await
    }
}

// 裸操作直接透传给底层实现
impl std::ops::Deref for Store {
    type Target = dyn KeyStore;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

// ---------------------------------------------------------------------------
// RedisStore — 生产实现
// ---------------------------------------------------------------------------

/// Redis 存储实现
pub struct RedisStore {
    client: Client,
}

impl RedisStore {
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        info!("Redis client created");
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(NotifyError::from)
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(NotifyError::from)
    }
}

#[async_trait]
impl KeyStore for RedisStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn().await?;
        let result: i64 = conn.incr(key, delta).await?;
        Ok(result)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.expire(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let count: u64 = conn.zcard(key).await?;
        Ok(count)
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = conn.zrangebyscore(key, min, max).await?;
        Ok(members)
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = conn.zrevrange(key, start, stop).await?;
        Ok(members)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.zrem(key, member).await?;
        Ok(())
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.zrembyscore(key, min, max).await?;
        Ok(removed)
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn().await?;
        let result: i64 = conn.hincr(key, field, delta).await?;
        Ok(result)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.lpush(key, value).await?;
        Ok(len)
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.rpop(key, None).await?;
        Ok(value)
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.llen(key).await?;
        Ok(len)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let values: Vec<String> = conn.lrange(key, start, stop).await?;
        Ok(values)
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.ltrim(key, start, stop).await?;
        Ok(())
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.lrem(key, 0, value).await?;
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// MemoryStore — 内存实现
// ---------------------------------------------------------------------------

/// 内存中的值类型
enum Entry {
    Str(String),
    ZSet(HashMap<String, f64>),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
}

struct Record {
    entry: Entry,
    expires_at: Option<Instant>,
}

impl Record {
    fn new(entry: Entry) -> Self {
        Self {
            entry,
            expires_at: None,
        }
    }

    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// 内存存储实现
///
/// 行为与 Redis 实现对齐：惰性过期、类型不匹配报错。
/// 供单元测试、沙箱运行和本地开发使用。
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 访问指定键的记录，过期记录视同不存在并移除
    fn with_record<T>(
        &self,
        key: &str,
        f: impl FnOnce(Option<&mut Record>) -> Result<T>,
    ) -> Result<T> {
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|r| r.expired()) {
            data.remove(key);
        }
        f(data.get_mut(key))
    }

    /// 访问或创建指定键的记录
    fn with_record_or<T>(
        &self,
        key: &str,
        make: impl FnOnce() -> Entry,
        f: impl FnOnce(&mut Record) -> Result<T>,
    ) -> Result<T> {
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|r| r.expired()) {
            data.remove(key);
        }
        let record = data
            .entry(key.to_string())
            .or_insert_with(|| Record::new(make()));
        f(record)
    }
}

fn type_error(key: &str) -> NotifyError {
    NotifyError::Store(format!("键 {key} 的值类型不匹配"))
}

/// glob 风格的简易模式匹配，仅支持 `*` 通配符
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 && !pattern.ends_with('*') {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        self.with_record(key, |record| match record {
            Some(r) => match &r.entry {
                Entry::Str(s) => Ok(Some(s.clone())),
                _ => Err(type_error(key)),
            },
            None => Ok(None),
        })
    }

    async fn set_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut data = self.data.lock();
        data.insert(
            key.to_string(),
            Record {
                entry: Entry::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.data.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.with_record(key, |record| Ok(record.is_some()))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut data = self.data.lock();
        data.retain(|_, r| !r.expired());
        Ok(data
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        self.with_record_or(
            key,
            || Entry::Str("0".to_string()),
            |record| match &mut record.entry {
                Entry::Str(s) => {
                    let current: i64 = s
                        .parse()
                        .map_err(|_| NotifyError::Store(format!("键 {key} 的值不是整数")))?;
                    let next = current + delta;
                    *s = next.to_string();
                    Ok(next)
                }
                _ => Err(type_error(key)),
            },
        )
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.with_record(key, |record| {
            if let Some(r) = record {
                r.expires_at = Some(Instant::now() + ttl);
            }
            Ok(())
        })
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.with_record_or(
            key,
            || Entry::ZSet(HashMap::new()),
            |record| match &mut record.entry {
                Entry::ZSet(set) => {
                    set.insert(member.to_string(), score);
                    Ok(())
                }
                _ => Err(type_error(key)),
            },
        )
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        self.with_record(key, |record| match record {
            Some(r) => match &r.entry {
                Entry::ZSet(set) => Ok(set.len() as u64),
                _ => Err(type_error(key)),
            },
            None => Ok(0),
        })
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        self.with_record(key, |record| match record {
            Some(r) => match &r.entry {
                Entry::ZSet(set) => {
                    let mut members: Vec<(&String, f64)> = set
                        .iter()
                        .filter(|&(_, &s)| s >= min && s <= max)
                        .map(|(m, &s)| (m, s))
                        .collect();
                    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
                    Ok(members.into_iter().map(|(m, _)| m.clone()).collect())
                }
                _ => Err(type_error(key)),
            },
            None => Ok(Vec::new()),
        })
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.with_record(key, |record| match record {
            Some(r) => match &r.entry {
                Entry::ZSet(set) => {
                    let mut members: Vec<(&String, f64)> =
                        set.iter().map(|(m, &s)| (m, s)).collect();
                    members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(a.0)));

                    let len = members.len() as isize;
                    let norm = |i: isize| -> usize {
                        if i < 0 {
                            (len + i).max(0) as usize
                        } else {
                            i.min(len) as usize
                        }
                    };
                    let from = norm(start);
                    let to = (norm(stop) + 1).min(members.len());
                    if from >= to {
                        return Ok(Vec::new());
                    }
                    Ok(members[from..to].iter().map(|(m, _)| (*m).clone()).collect())
                }
                _ => Err(type_error(key)),
            },
            None => Ok(Vec::new()),
        })
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        self.with_record(key, |record| {
            if let Some(r) = record {
                match &mut r.entry {
                    Entry::ZSet(set) => {
                        set.remove(member);
                    }
                    _ => return Err(type_error(key)),
                }
            }
            Ok(())
        })
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        self.with_record(key, |record| {
            if let Some(r) = record {
                match &mut r.entry {
                    Entry::ZSet(set) => {
                        let before = set.len();
                        set.retain(|_, &mut s| s < min || s > max);
                        Ok((before - set.len()) as u64)
                    }
                    _ => Err(type_error(key)),
                }
            } else {
                Ok(0)
            }
        })
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.with_record_or(
            key,
            || Entry::Hash(HashMap::new()),
            |record| match &mut record.entry {
                Entry::Hash(map) => {
                    let slot = map.entry(field.to_string()).or_insert_with(|| "0".to_string());
                    let current: i64 = slot
                        .parse()
                        .map_err(|_| NotifyError::Store(format!("字段 {field} 的值不是整数")))?;
                    let next = current + delta;
                    *slot = next.to_string();
                    Ok(next)
                }
                _ => Err(type_error(key)),
            },
        )
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.with_record(key, |record| match record {
            Some(r) => match &r.entry {
                Entry::Hash(map) => Ok(map.clone()),
                _ => Err(type_error(key)),
            },
            None => Ok(HashMap::new()),
        })
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<u64> {
        self.with_record_or(
            key,
            || Entry::List(VecDeque::new()),
            |record| match &mut record.entry {
                Entry::List(list) => {
                    list.push_front(value.to_string());
                    Ok(list.len() as u64)
                }
                _ => Err(type_error(key)),
            },
        )
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        self.with_record(key, |record| {
            if let Some(r) = record {
                match &mut r.entry {
                    Entry::List(list) => Ok(list.pop_back()),
                    _ => Err(type_error(key)),
                }
            } else {
                Ok(None)
            }
        })
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        self.with_record(key, |record| match record {
            Some(r) => match &r.entry {
                Entry::List(list) => Ok(list.len() as u64),
                _ => Err(type_error(key)),
            },
            None => Ok(0),
        })
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.with_record(key, |record| match record {
            Some(r) => match &r.entry {
                Entry::List(list) => {
                    let len = list.len() as isize;
                    let norm = |i: isize| -> usize {
                        if i < 0 {
                            (len + i).max(0) as usize
                        } else {
                            i.min(len) as usize
                        }
                    };
                    let from = norm(start);
                    let to = (norm(stop) + 1).min(list.len());
                    if from >= to {
                        return Ok(Vec::new());
                    }
                    Ok(list.iter().skip(from).take(to - from).cloned().collect())
                }
                _ => Err(type_error(key)),
            },
            None => Ok(Vec::new()),
        })
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        self.with_record(key, |record| {
            if let Some(r) = record {
                match &mut r.entry {
                    Entry::List(list) => {
                        let len = list.len() as isize;
                        let norm = |i: isize| -> usize {
                            if i < 0 {
                                (len + i).max(0) as usize
                            } else {
                                i.min(len) as usize
                            }
                        };
                        let from = norm(start);
                        let to = (norm(stop) + 1).min(list.len());
                        let kept: VecDeque<String> = if from >= to {
                            VecDeque::new()
                        } else {
                            list.iter().skip(from).take(to - from).cloned().collect()
                        };
                        *list = kept;
                    }
                    _ => return Err(type_error(key)),
                }
            }
            Ok(())
        })
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<u64> {
        self.with_record(key, |record| {
            if let Some(r) = record {
                match &mut r.entry {
                    Entry::List(list) => {
                        let before = list.len();
                        list.retain(|v| v != value);
                        Ok((before - list.len()) as u64)
                    }
                    _ => Err(type_error(key)),
                }
            } else {
                Ok(0)
            }
        })
    }
}

// ---------------------------------------------------------------------------
// FailingStore — 故障注入实现
// ---------------------------------------------------------------------------

/// 故障注入存储
///
/// 所有操作返回存储错误，用于验证降级路径：
/// 限流器放行（fail open）、偏好读取回退默认值等。
pub struct FailingStore;

macro_rules! failing {
    () => {
        Err(NotifyError::Store("存储不可达（故障注入）".to_string()))
    };
}

#[async_trait]
impl KeyStore for FailingStore {
    async fn get_raw(&self, _key: &str) -> Result<Option<String>> {
        failing!()
    }
    async fn set_raw(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<()> {
        failing!()
    }
    async fn del(&self, _key: &str) -> Result<()> {
        failing!()
    }
    async fn exists(&self, _key: &str) -> Result<bool> {
        failing!()
    }
    async fn keys(&self, _pattern: &str) -> Result<Vec<String>> {
        failing!()
    }
    async fn incr(&self, _key: &str, _delta: i64) -> Result<i64> {
        failing!()
    }
    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<()> {
        failing!()
    }
    async fn zadd(&self, _key: &str, _member: &str, _score: f64) -> Result<()> {
        failing!()
    }
    async fn zcard(&self, _key: &str) -> Result<u64> {
        failing!()
    }
    async fn zrange_by_score(&self, _key: &str, _min: f64, _max: f64) -> Result<Vec<String>> {
        failing!()
    }
    async fn zrevrange(&self, _key: &str, _start: isize, _stop: isize) -> Result<Vec<String>> {
        failing!()
    }
    async fn zrem(&self, _key: &str, _member: &str) -> Result<()> {
        failing!()
    }
    async fn zrem_range_by_score(&self, _key: &str, _min: f64, _max: f64) -> Result<u64> {
        failing!()
    }
    async fn hincr(&self, _key: &str, _field: &str, _delta: i64) -> Result<i64> {
        failing!()
    }
    async fn hgetall(&self, _key: &str) -> Result<HashMap<String, String>> {
        failing!()
    }
    async fn lpush(&self, _key: &str, _value: &str) -> Result<u64> {
        failing!()
    }
    async fn rpop(&self, _key: &str) -> Result<Option<String>> {
        failing!()
    }
    async fn llen(&self, _key: &str) -> Result<u64> {
        failing!()
    }
    async fn lrange(&self, _key: &str, _start: isize, _stop: isize) -> Result<Vec<String>> {
        failing!()
    }
    async fn ltrim(&self, _key: &str, _start: isize, _stop: isize) -> Result<()> {
        failing!()
    }
    async fn lrem(&self, _key: &str, _value: &str) -> Result<u64> {
        failing!()
    }
}

impl Store {
    /// 创建故障注入存储句柄（仅测试使用）
    pub fn failing() -> Self {
        Self::new(Arc::new(FailingStore))
    }
}

// ---------------------------------------------------------------------------
// StoreKey — 键名生成器
// ---------------------------------------------------------------------------

/// 存储键生成器
///
/// 所有键集中在此定义，避免键名拼写分散在各组件中。
pub struct StoreKey;

impl StoreKey {
    // ---- 用户偏好 ----
    pub fn preferences(user_id: &str) -> String {
        format!("notify:prefs:{user_id}")
    }

    // ---- 限流窗口 ----
    pub fn rate_window(scope: &str, identifier: &str) -> String {
        format!("notify:rate:{scope}:{identifier}")
    }

    // ---- 队列 ----
    pub fn queue(priority: &str) -> String {
        format!("notify:queue:{priority}")
    }

    pub fn queue_delayed(priority: &str) -> String {
        format!("notify:queue:{priority}:delayed")
    }

    pub fn queue_processing(priority: &str) -> String {
        format!("notify:queue:{priority}:processing")
    }

    pub fn queue_counter(priority: &str, kind: &str) -> String {
        format!("notify:queue:{priority}:{kind}")
    }

    pub fn queue_dead() -> String {
        "notify:queue:dead".to_string()
    }

    // ---- 统计 ----
    pub fn stats_total() -> String {
        "notify:stats:total".to_string()
    }

    pub fn stats_daily(date: &str) -> String {
        format!("notify:stats:daily:{date}")
    }

    pub fn stats_hourly(hour: &str) -> String {
        format!("notify:stats:hourly:{hour}")
    }

    pub fn stats_by_type() -> String {
        "notify:stats:by_type".to_string()
    }

    pub fn stats_by_channel() -> String {
        "notify:stats:by_channel".to_string()
    }

    pub fn stats_by_severity() -> String {
        "notify:stats:by_severity".to_string()
    }

    pub fn stats_delivery(channel: &str) -> String {
        format!("notify:stats:delivery:{channel}")
    }

    pub fn stats_delivered_total() -> String {
        "notify:stats:delivered".to_string()
    }

    pub fn stats_failed_total() -> String {
        "notify:stats:failed".to_string()
    }

    pub fn stats_errors() -> String {
        "notify:stats:errors".to_string()
    }

    pub fn stats_recent() -> String {
        "notify:stats:recent".to_string()
    }

    pub fn stats_engagement() -> String {
        "notify:stats:engagement".to_string()
    }

    pub fn stats_user(user_id: &str) -> String {
        format!("notify:stats:user:{user_id}")
    }

    pub fn delivery_log() -> String {
        "notify:log:delivery".to_string()
    }

    // ---- 站内信 ----
    pub fn inapp_feed(user_id: &str) -> String {
        format!("notify:inapp:feed:{user_id}")
    }

    pub fn inapp_unread(user_id: &str) -> String {
        format!("notify:inapp:unread:{user_id}")
    }

    pub fn inapp_record(record_id: &str) -> String {
        format!("notify:inapp:record:{record_id}")
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
