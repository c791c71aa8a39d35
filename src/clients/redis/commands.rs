/// Command tables for key based Redis commands
use lazy_static::lazy_static;
use std::collections::HashSet;

lazy_static! {
    /// Commands that never modify data; in master-slave mode they may be
    /// served by a slave
    pub static ref READ_COMMANDS: HashSet<&'static str> = [
        "BITCOUNT", "BITPOS", "DUMP", "EXISTS", "GEODIST", "GEOHASH", "GEOPOS",
        "GEORADIUS_RO", "GEORADIUSBYMEMBER_RO", "GET", "GETBIT", "GETRANGE",
        "HEXISTS", "HGET", "HGETALL", "HKEYS", "HLEN", "HMGET", "HSCAN",
        "HSTRLEN", "HVALS", "LINDEX", "LLEN", "LRANGE", "MGET", "PFCOUNT",
        "PTTL", "SCARD", "SISMEMBER", "SMEMBERS", "SRANDMEMBER", "SSCAN",
        "STRLEN", "TTL", "TYPE", "ZCARD", "ZCOUNT", "ZLEXCOUNT", "ZRANGE",
        "ZRANGEBYLEX", "ZRANGEBYSCORE", "ZRANK", "ZREVRANGE", "ZREVRANGEBYLEX",
        "ZREVRANGEBYSCORE", "ZREVRANK", "ZSCAN", "ZSCORE",
    ]
    .into_iter()
    .collect();

    /// Every command accepted by `Client::do_command`; the first argument of
    /// each is a key
    pub static ref ALL_COMMANDS: HashSet<&'static str> = READ_COMMANDS
        .iter()
        .copied()
        .chain([
            "APPEND", "BITFIELD", "BITOP", "DECR", "DECRBY", "DEL", "EXPIRE",
            "EXPIREAT", "GEOADD", "GEORADIUS", "GEORADIUSBYMEMBER", "GETSET",
            "HDEL", "HINCRBY", "HINCRBYFLOAT", "HMSET", "HSET", "HSETNX", "INCR",
            "INCRBY", "INCRBYFLOAT", "LINSERT", "LPOP", "LPUSH", "LPUSHX", "LREM",
            "LSET", "LTRIM", "PERSIST", "PEXPIRE", "PEXPIREAT", "PFADD", "PSETEX",
            "RESTORE", "RPOP", "RPUSH", "RPUSHX", "SADD", "SET", "SETBIT", "SETEX",
            "SETNX", "SETRANGE", "SORT", "SPOP", "SREM", "UNLINK", "ZADD",
            "ZINCRBY", "ZPOPMAX", "ZPOPMIN", "ZREM", "ZREMRANGEBYLEX",
            "ZREMRANGEBYRANK", "ZREMRANGEBYSCORE",
        ])
        .collect();
}

pub fn is_read_command(cmd: &str) -> bool {
    READ_COMMANDS.contains(cmd)
}

pub fn is_known_command(cmd: &str) -> bool {
    ALL_COMMANDS.contains(cmd)
}
