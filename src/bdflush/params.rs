//! bdflush 可调参数表
//!
//! 九个整数参数，每个都有强制的取值范围。越界的更新会被拒绝。
//!
//! | 索引 | 参数 | 默认值 | 范围 |
//! |------|------|--------|------|
//! | 0 | `nfract` | 25 | 0..=100 |
//! | 1 | `ndirty` | 500 | 10..=5000 |
//! | 2 | `nrefill` | 64 | 5..=2000 |
//! | 3 | `nref_dirt` | 256 | 25..=2000 |
//! | 4 | `clu_nfract` | 15 | 0..=100 |
//! | 5 | `age_buffer` | 3000 | 100..=60000 |
//! | 6 | `age_super` | 500 | 100..=60000 |
//! | 7 | `lav_const` | 1884 | 1..=2047 |
//! | 8 | `lav_ratio` | 2 | 1..=5 |

use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{N_PARAM, PARAM_IMAGE_SIZE};
use crate::error::{Error, ErrorKind, Result};

/// 参数下限
pub const PARAM_MIN: [u32; N_PARAM] = [0, 10, 5, 25, 0, 100, 100, 1, 1];

/// 参数上限
pub const PARAM_MAX: [u32; N_PARAM] = [100, 5000, 2000, 2000, 100, 60000, 60000, 2047, 5];

/// 参数名
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    /// 触发 bdflush 的脏缓冲区百分比
    Nfract,
    /// 每个唤醒周期最多写出的脏块数
    Ndirty,
    /// 每次 refill 尝试获得的干净缓冲区数
    Nrefill,
    /// refill 扫描时遇到多少个脏缓冲区后唤醒 bdflush
    NrefDirt,
    /// 寻找空闲簇时扫描的缓存百分比
    CluNfract,
    /// 普通缓冲区在刷新前的老化时间（jiffies）
    AgeBuffer,
    /// 超级块缓冲区在刷新前的老化时间（jiffies）
    AgeSuper,
    /// 负载均值的时间常数
    LavConst,
    /// 大小等级负载均值的裁剪比例
    LavRatio,
}

impl Param {
    /// 全部参数，按索引顺序排列
    pub const ALL: [Param; N_PARAM] = [
        Param::Nfract,
        Param::Ndirty,
        Param::Nrefill,
        Param::NrefDirt,
        Param::CluNfract,
        Param::AgeBuffer,
        Param::AgeSuper,
        Param::LavConst,
        Param::LavRatio,
    ];

    /// 参数索引
    pub const fn index(self) -> usize {
        self as usize
    }

    /// 由索引构造
    pub fn from_index(index: usize) -> Result<Self> {
        Self::ALL
            .get(index)
            .copied()
            .ok_or(Error::new(ErrorKind::InvalidInput, "bdflush parameter index out of range"))
    }
}

/// bdflush 参数表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdflushParams {
    /// 触发 bdflush 的脏缓冲区百分比
    pub nfract: u32,
    /// 每个唤醒周期最多写出的脏块数
    pub ndirty: u32,
    /// 每次 refill 尝试获得的干净缓冲区数
    pub nrefill: u32,
    /// refill 扫描时的脏缓冲区阈值
    pub nref_dirt: u32,
    /// 寻找空闲簇时扫描的缓存百分比
    pub clu_nfract: u32,
    /// 普通缓冲区老化时间
    pub age_buffer: u32,
    /// 超级块缓冲区老化时间
    pub age_super: u32,
    /// 负载均值时间常数
    pub lav_const: u32,
    /// 负载均值裁剪比例
    pub lav_ratio: u32,
}

impl Default for BdflushParams {
    fn default() -> Self {
        Self {
            nfract: 25,
            ndirty: 500,
            nrefill: 64,
            nref_dirt: 256,
            clu_nfract: 15,
            age_buffer: 3000,
            age_super: 500,
            lav_const: 1884,
            lav_ratio: 2,
        }
    }
}

impl BdflushParams {
    /// 读取一个参数
    pub fn get(&self, param: Param) -> u32 {
        match param {
            Param::Nfract => self.nfract,
            Param::Ndirty => self.ndirty,
            Param::Nrefill => self.nrefill,
            Param::NrefDirt => self.nref_dirt,
            Param::CluNfract => self.clu_nfract,
            Param::AgeBuffer => self.age_buffer,
            Param::AgeSuper => self.age_super,
            Param::LavConst => self.lav_const,
            Param::LavRatio => self.lav_ratio,
        }
    }

    /// 设置一个参数
    ///
    /// # 返回
    ///
    /// 值超出 `[PARAM_MIN, PARAM_MAX]` 时返回 `InvalidInput`，参数表不变
    pub fn set(&mut self, param: Param, value: u32) -> Result<()> {
        check_range(param, value)?;
        let slot = match param {
            Param::Nfract => &mut self.nfract,
            Param::Ndirty => &mut self.ndirty,
            Param::Nrefill => &mut self.nrefill,
            Param::NrefDirt => &mut self.nref_dirt,
            Param::CluNfract => &mut self.clu_nfract,
            Param::AgeBuffer => &mut self.age_buffer,
            Param::AgeSuper => &mut self.age_super,
            Param::LavConst => &mut self.lav_const,
            Param::LavRatio => &mut self.lav_ratio,
        };
        *slot = value;
        Ok(())
    }

    /// 按索引读取
    pub fn get_index(&self, index: usize) -> Result<u32> {
        Ok(self.get(Param::from_index(index)?))
    }

    /// 按索引设置
    pub fn set_index(&mut self, index: usize, value: u32) -> Result<()> {
        self.set(Param::from_index(index)?, value)
    }

    /// 转换为数组（按索引顺序）
    pub fn to_array(&self) -> [u32; N_PARAM] {
        Param::ALL.map(|p| self.get(p))
    }

    /// 由数组构造，逐项检查范围
    pub fn from_array(values: [u32; N_PARAM]) -> Result<Self> {
        let mut params = Self::default();
        for (param, value) in Param::ALL.into_iter().zip(values) {
            params.set(param, value)?;
        }
        Ok(params)
    }

    /// 检查全部参数是否在范围内
    pub fn validate(&self) -> Result<()> {
        Param::ALL.into_iter().try_for_each(|p| check_range(p, self.get(p)))
    }

    /// 序列化为小端字节镜像
    pub fn to_bytes(&self) -> [u8; PARAM_IMAGE_SIZE] {
        let mut buf = [0u8; PARAM_IMAGE_SIZE];
        LittleEndian::write_u32_into(&self.to_array(), &mut buf);
        buf
    }

    /// 从小端字节镜像恢复
    ///
    /// # 返回
    ///
    /// 长度不对或有参数越界时返回 `InvalidInput`
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != PARAM_IMAGE_SIZE {
            return Err(Error::new(ErrorKind::InvalidInput, "bdflush parameter image has wrong length"));
        }
        let mut values = [0u32; N_PARAM];
        LittleEndian::read_u32_into(buf, &mut values);
        Self::from_array(values)
    }
}

fn check_range(param: Param, value: u32) -> Result<()> {
    let i = param.index();
    if value < PARAM_MIN[i] || value > PARAM_MAX[i] {
        log::error!(
            "[BDFLUSH] parameter {:?} = {} outside {}..={}",
            param,
            value,
            PARAM_MIN[i],
            PARAM_MAX[i]
        );
        return Err(Error::new(ErrorKind::InvalidInput, "bdflush parameter out of range"));
    }
    Ok(())
}
