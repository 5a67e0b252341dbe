//! Lua scripts run by the Redis broker.
//!
//! Each script is a single atomic step on the server. Scores are epoch
//! milliseconds.

use redis::Script;

/// RPUSH onto the ready list and PUBLISH the queue name.
///
/// KEYS: ready, channel. ARGV: raw, queue name.
const ENQUEUE_READY: &str = r#"
local len = redis.call('RPUSH', KEYS[1], ARGV[1])
redis.call('PUBLISH', KEYS[2], ARGV[2])
return len
"#;

/// LPOP the ready list into the processing set.
///
/// KEYS: ready, processing. ARGV: deadline.
const POP_READY: &str = r#"
local raw = redis.call('LPOP', KEYS[1])
if not raw then
    return false
end
redis.call('ZADD', KEYS[2], ARGV[1], raw)
return raw
"#;

/// Promote due delayed entries onto the ready list.
///
/// KEYS: delayed, ready, channel. ARGV: now, limit, queue name.
const MOVE_DUE: &str = r#"
local kind = redis.call('TYPE', KEYS[2])['ok']
if kind ~= 'none' and kind ~= 'list' then
    return redis.error_reply('WRONGTYPE ' .. KEYS[2] .. ' holds a ' .. kind)
end
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local moved = {}
for _, raw in ipairs(due) do
    if redis.call('ZREM', KEYS[1], raw) == 1 then
        redis.call('RPUSH', KEYS[2], raw)
        moved[#moved + 1] = raw
    end
end
if #moved > 0 then
    redis.call('PUBLISH', KEYS[3], ARGV[3])
end
return moved
"#;

/// Remove an in-flight entry and, only if it was present, place the new
/// envelope. A target of the wrong type fails before anything is removed.
///
/// KEYS: processing, target, channel.
/// ARGV: raw, action (ready | delayed | dead_letter | discard), new raw,
/// score, queue name.
const RESOLVE: &str = r#"
local expected = ({ ready = 'list', delayed = 'zset', dead_letter = 'list' })[ARGV[2]]
if expected then
    local kind = redis.call('TYPE', KEYS[2])['ok']
    if kind ~= 'none' and kind ~= expected then
        return redis.error_reply('WRONGTYPE ' .. KEYS[2] .. ' holds a ' .. kind)
    end
end
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
    return 0
end
local action = ARGV[2]
if action == 'ready' then
    redis.call('RPUSH', KEYS[2], ARGV[3])
    redis.call('PUBLISH', KEYS[3], ARGV[5])
elseif action == 'delayed' then
    redis.call('ZADD', KEYS[2], ARGV[4], ARGV[3])
elseif action == 'dead_letter' then
    redis.call('RPUSH', KEYS[2], ARGV[3])
end
return 1
"#;

/// Move entries from the head of one list or zset to another.
///
/// KEYS: src, dst. ARGV: src type, dst type, max, score.
const MOVE_ENTRIES: &str = r#"
for i = 1, 2 do
    local kind = redis.call('TYPE', KEYS[i])['ok']
    if kind ~= 'none' and kind ~= ARGV[i] then
        return redis.error_reply('WRONGTYPE ' .. KEYS[i] .. ' holds a ' .. kind)
    end
end
local max = tonumber(ARGV[3])
if max <= 0 then
    return 0
end
local entries
if ARGV[1] == 'zset' then
    entries = redis.call('ZRANGE', KEYS[1], 0, max - 1)
    if #entries > 0 then
        redis.call('ZREMRANGEBYRANK', KEYS[1], 0, #entries - 1)
    end
else
    entries = redis.call('LRANGE', KEYS[1], 0, max - 1)
    if #entries > 0 then
        redis.call('LTRIM', KEYS[1], #entries, -1)
    end
end
for _, raw in ipairs(entries) do
    if ARGV[2] == 'zset' then
        redis.call('ZADD', KEYS[2], ARGV[4], raw)
    else
        redis.call('RPUSH', KEYS[2], raw)
    end
end
return #entries
"#;

/// Drop fields sorting below the cutoff, HINCRBY several fields and refresh
/// the TTL.
///
/// KEYS: stats. ARGV: ttl ms, cutoff, then field/increment pairs.
const INCREMENT_STATS: &str = r#"
for _, field in ipairs(redis.call('HKEYS', KEYS[1])) do
    if field < ARGV[2] then
        redis.call('HDEL', KEYS[1], field)
    end
end
for i = 3, #ARGV, 2 do
    redis.call('HINCRBY', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('PEXPIRE', KEYS[1], ARGV[1])
return 1
"#;

/// Size of whatever structure lives under a key.
///
/// KEYS: key.
const SIZE: &str = r#"
local kind = redis.call('TYPE', KEYS[1])['ok']
if kind == 'list' then
    return redis.call('LLEN', KEYS[1])
elseif kind == 'zset' then
    return redis.call('ZCARD', KEYS[1])
elseif kind == 'hash' then
    return redis.call('HLEN', KEYS[1])
elseif kind == 'string' then
    return 1
end
return 0
"#;

/// Scripts with their SHA computed once.
pub(crate) struct Scripts {
    pub enqueue_ready: Script,
    pub pop_ready: Script,
    pub move_due: Script,
    pub resolve: Script,
    pub move_entries: Script,
    pub increment_stats: Script,
    pub size: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            enqueue_ready: Script::new(ENQUEUE_READY),
            pop_ready: Script::new(POP_READY),
            move_due: Script::new(MOVE_DUE),
            resolve: Script::new(RESOLVE),
            move_entries: Script::new(MOVE_ENTRIES),
            increment_stats: Script::new(INCREMENT_STATS),
            size: Script::new(SIZE),
        }
    }
}
