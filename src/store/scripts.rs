//! Lua scripts executed by the Redis store.
//!
//! Each script performs one strategy transition server-side so the
//! read-modify-write is atomic. The arithmetic mirrors `ratelimit::strategy`.
//!
//! Common arguments: ARGV[1] limit/capacity, ARGV[2] window seconds,
//! ARGV[3] now (epoch seconds), ARGV[4] ttl seconds, ARGV[5] rate.
//! Every script returns `{allowed, remaining, reset_at, retry_after}` where
//! `reset_at` is a string so fractional seconds survive the reply.
//!
//! A key left behind by a different strategy (after a rule override) is
//! deleted first, so the request is evaluated as first-seen.

pub const FIXED_WINDOW: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local kind = redis.call('TYPE', key).ok
if kind ~= 'none' and (kind ~= 'hash' or redis.call('HEXISTS', key, 'count') == 0) then
  redis.call('DEL', key)
end

local start = math.floor(now / window) * window
local reset_at = start + window
local stored = redis.call('HMGET', key, 'start', 'count')
local count = 0
if stored[1] and tonumber(stored[1]) == start then
  count = tonumber(stored[2]) or 0
end

if count >= limit then
  return {0, 0, string.format('%.6f', reset_at), math.max(1, math.ceil(reset_at - now))}
end

count = count + 1
redis.call('HSET', key, 'start', start, 'count', count)
redis.call('EXPIRE', key, ttl)
return {1, limit - count, string.format('%.6f', reset_at), 0}
"#;

/// ARGV[6] is a unique member for the request's log entry.
pub const SLIDING_WINDOW: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local member = ARGV[6]

local kind = redis.call('TYPE', key).ok
if kind ~= 'none' and kind ~= 'zset' then
  redis.call('DEL', key)
end

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local reset_at = now + window
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
  reset_at = tonumber(oldest[2]) + window
end

if count >= limit then
  return {0, 0, string.format('%.6f', reset_at), math.max(1, math.ceil(reset_at - now))}
end

redis.call('ZADD', key, ARGV[3], member)
redis.call('EXPIRE', key, ttl)
return {1, limit - count - 1, string.format('%.6f', reset_at), 0}
"#;

pub const TOKEN_BUCKET: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local rate = tonumber(ARGV[5])

local kind = redis.call('TYPE', key).ok
if kind ~= 'none' and (kind ~= 'hash' or redis.call('HEXISTS', key, 'tokens') == 0) then
  redis.call('DEL', key)
end

local stored = redis.call('HMGET', key, 'tokens', 'last')
local tokens = capacity
if stored[1] and stored[2] then
  local elapsed = math.max(0, now - tonumber(stored[2]))
  tokens = math.min(capacity, tonumber(stored[1]) + elapsed * rate)
end

local allowed = 0
local retry_after = 0
if tokens + 1e-9 >= 1 then
  tokens = math.max(0, tokens - 1)
  allowed = 1
elseif rate > 0 then
  retry_after = math.max(1, math.ceil(1 / rate))
else
  retry_after = 1
end

local reset_at = now
if rate > 0 then
  reset_at = now + (capacity - tokens) / rate
end

redis.call('HSET', key, 'tokens', string.format('%.17g', tokens), 'last', ARGV[3])
redis.call('EXPIRE', key, ttl)
return {allowed, math.floor(tokens + 1e-9), string.format('%.6f', reset_at), retry_after}
"#;

pub const LEAKY_BUCKET: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local rate = tonumber(ARGV[5])

local kind = redis.call('TYPE', key).ok
if kind ~= 'none' and (kind ~= 'hash' or redis.call('HEXISTS', key, 'level') == 0) then
  redis.call('DEL', key)
end

local stored = redis.call('HMGET', key, 'level', 'last')
local level = 0
if stored[1] and stored[2] then
  local elapsed = math.max(0, now - tonumber(stored[2]))
  level = math.max(0, tonumber(stored[1]) - elapsed * rate)
end

local allowed = 0
local retry_after = 0
if level + 1e-9 < capacity then
  level = level + 1
  allowed = 1
elseif rate > 0 then
  retry_after = math.max(1, math.ceil(1 / rate))
else
  retry_after = 1
end

local reset_at = now
if rate > 0 then
  reset_at = now + level / rate
end

local remaining = 0
if allowed == 1 then
  remaining = math.max(0, math.floor(capacity - level + 1e-9))
end

redis.call('HSET', key, 'level', string.format('%.17g', level), 'last', ARGV[3])
redis.call('EXPIRE', key, ttl)
return {allowed, remaining, string.format('%.6f', reset_at), retry_after}
"#;
