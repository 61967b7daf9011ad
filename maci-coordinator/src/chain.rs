//! Access to the poll contract.
//!
//! The pipeline only ever sees the [`PollEndpoint`] and [`PollWriter`]
//! traits; the ethers-backed implementations here talk JSON-RPC, tests use
//! an in-memory contract.

use std::sync::Arc;

use async_trait::async_trait;
use ethers::{
    abi::{ParamType, Token},
    prelude::*,
    types::transaction::eip2718::TypedTransaction,
};
use maci_common::{
    fr_from_be_bytes, fr_to_be_bytes, Fr, MaxValues, Message, PollInfo, PubKey, TreeDepths,
    MESSAGE_DATA_LENGTH,
};
use tracing::{debug, info};

use crate::error::{CoordinatorError, CoordinatorResult};

pub const SIGN_UP_EVENT: &str = "SignUp(uint256,(uint256,uint256),uint256,uint256)";
pub const PUBLISH_MESSAGE_EVENT: &str = "PublishMessage((uint256,uint256[10]),(uint256,uint256))";

/// A log as returned by the node, before decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawLog {
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
    pub topic0: [u8; 32],
    pub data: Vec<u8>,
}

impl RawLog {
    /// Position of the log in chain order.
    pub fn position(&self) -> (u64, u64, u64) {
        (self.block_number, self.transaction_index, self.log_index)
    }
}

/// Read-only views of a poll.
#[async_trait]
pub trait PollEndpoint: Send + Sync {
    async fn poll_id(&self) -> CoordinatorResult<u64>;

    async fn num_signups(&self) -> CoordinatorResult<u64>;

    async fn num_messages(&self) -> CoordinatorResult<u64>;

    async fn state_aq_merged(&self) -> CoordinatorResult<bool>;

    async fn merged_state_root(&self) -> CoordinatorResult<Fr>;

    async fn tree_depths(&self) -> CoordinatorResult<TreeDepths>;

    /// Main root of the message queue at `depth`; zero while unmerged.
    async fn message_aq_main_root(&self, depth: usize) -> CoordinatorResult<Fr>;

    async fn max_values(&self) -> CoordinatorResult<MaxValues>;

    async fn coordinator_pub_key(&self) -> CoordinatorResult<PubKey>;

    async fn deploy_time_and_duration(&self) -> CoordinatorResult<(u64, u64)>;

    async fn block_number(&self) -> CoordinatorResult<u64>;

    /// `SignUp` and `PublishMessage` logs in `[from_block, to_block]`.
    async fn fetch_logs(&self, from_block: u64, to_block: u64) -> CoordinatorResult<Vec<RawLog>>;

    async fn poll_info(&self) -> CoordinatorResult<PollInfo> {
        let (deploy_time, duration) = self.deploy_time_and_duration().await?;
        Ok(PollInfo {
            poll_id: self.poll_id().await?,
            deploy_time,
            duration,
            tree_depths: self.tree_depths().await?,
            max_values: self.max_values().await?,
            coordinator_pub_key: self.coordinator_pub_key().await?,
        })
    }
}

/// Write access used by the replay tool.
#[async_trait]
pub trait PollWriter: Send + Sync {
    async fn num_signups(&self) -> CoordinatorResult<u64>;

    async fn num_messages(&self) -> CoordinatorResult<u64>;

    async fn sign_up(&self, pub_key: &PubKey, voice_credit_balance: u64) -> CoordinatorResult<()>;

    async fn publish_message(&self, message: &Message) -> CoordinatorResult<()>;

    async fn state_root(&self) -> CoordinatorResult<Fr>;

    async fn message_root(&self) -> CoordinatorResult<Fr>;
}

/// A decoded poll event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollEvent {
    SignUp {
        state_index: u64,
        pub_key: PubKey,
        voice_credit_balance: u64,
        timestamp: u64,
    },
    PublishMessage(Message),
}

pub fn sign_up_topic() -> [u8; 32] {
    ethers::utils::keccak256(SIGN_UP_EVENT.as_bytes())
}

pub fn publish_message_topic() -> [u8; 32] {
    ethers::utils::keccak256(PUBLISH_MESSAGE_EVENT.as_bytes())
}

pub fn fr_to_u256(value: &Fr) -> U256 {
    U256::from_big_endian(&fr_to_be_bytes(value))
}

pub fn u256_to_fr(value: U256) -> CoordinatorResult<Fr> {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    fr_from_be_bytes(&bytes).map_err(|e| CoordinatorError::Decode(e.to_string()))
}

fn u256_to_u64(value: U256, what: &str) -> CoordinatorResult<u64> {
    if value > U256::from(u64::MAX) {
        return Err(CoordinatorError::Decode(format!("{} {} overflows u64", what, value)));
    }
    Ok(value.as_u64())
}

fn point_tokens(point: (Fr, Fr)) -> Token {
    Token::Tuple(vec![
        Token::Uint(fr_to_u256(&point.0)),
        Token::Uint(fr_to_u256(&point.1)),
    ])
}

fn message_tokens(message: &Message) -> Token {
    Token::Tuple(vec![
        Token::Uint(fr_to_u256(&message.iv)),
        Token::FixedArray(
            message
                .data
                .iter()
                .map(|value| Token::Uint(fr_to_u256(value)))
                .collect(),
        ),
    ])
}

pub fn encode_sign_up(
    state_index: u64,
    pub_key: &PubKey,
    voice_credit_balance: u64,
    timestamp: u64,
) -> Vec<u8> {
    ethers::abi::encode(&[
        Token::Uint(U256::from(state_index)),
        point_tokens(pub_key.xy()),
        Token::Uint(U256::from(voice_credit_balance)),
        Token::Uint(U256::from(timestamp)),
    ])
}

pub fn encode_publish_message(message: &Message) -> Vec<u8> {
    ethers::abi::encode(&[message_tokens(message), point_tokens(message.enc_pub_key)])
}

fn point_param() -> ParamType {
    ParamType::Tuple(vec![ParamType::Uint(256), ParamType::Uint(256)])
}

fn expect_uint(token: Token, what: &str) -> CoordinatorResult<U256> {
    token
        .into_uint()
        .ok_or_else(|| CoordinatorError::Decode(format!("{} is not a uint", what)))
}

fn expect_tuple(token: Token, len: usize, what: &str) -> CoordinatorResult<Vec<Token>> {
    match token {
        Token::Tuple(items) | Token::FixedArray(items) if items.len() == len => Ok(items),
        other => Err(CoordinatorError::Decode(format!(
            "{} has unexpected shape: {:?}",
            what, other
        ))),
    }
}

fn decode_point(token: Token, what: &str) -> CoordinatorResult<(Fr, Fr)> {
    let mut items = expect_tuple(token, 2, what)?.into_iter();
    let (Some(x), Some(y)) = (items.next(), items.next()) else {
        return Err(CoordinatorError::Decode(format!("{} is truncated", what)));
    };
    Ok((
        u256_to_fr(expect_uint(x, what)?)?,
        u256_to_fr(expect_uint(y, what)?)?,
    ))
}

/// Decode a raw poll log. Unknown topics and malformed payloads are fatal.
pub fn decode_log(log: &RawLog) -> CoordinatorResult<PollEvent> {
    if log.topic0 == sign_up_topic() {
        let tokens = ethers::abi::decode(
            &[
                ParamType::Uint(256),
                point_param(),
                ParamType::Uint(256),
                ParamType::Uint(256),
            ],
            &log.data,
        )
        .map_err(|e| {
            CoordinatorError::Decode(format!("SignUp at block {}: {}", log.block_number, e))
        })?;
        let mut tokens = tokens.into_iter();
        let (Some(index), Some(key), Some(balance), Some(timestamp)) =
            (tokens.next(), tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(CoordinatorError::Decode("SignUp log is truncated".into()));
        };
        let (x, y) = decode_point(key, "SignUp public key")?;
        let pub_key = PubKey::from_xy(x, y)
            .map_err(|e| CoordinatorError::Decode(format!("SignUp public key: {}", e)))?;
        return Ok(PollEvent::SignUp {
            state_index: u256_to_u64(expect_uint(index, "state index")?, "state index")?,
            pub_key,
            voice_credit_balance: u256_to_u64(
                expect_uint(balance, "voice credit balance")?,
                "voice credit balance",
            )?,
            timestamp: u256_to_u64(expect_uint(timestamp, "timestamp")?, "timestamp")?,
        });
    }

    if log.topic0 == publish_message_topic() {
        let tokens = ethers::abi::decode(
            &[
                ParamType::Tuple(vec![
                    ParamType::Uint(256),
                    ParamType::FixedArray(Box::new(ParamType::Uint(256)), MESSAGE_DATA_LENGTH),
                ]),
                point_param(),
            ],
            &log.data,
        )
        .map_err(|e| {
            CoordinatorError::Decode(format!("PublishMessage at block {}: {}", log.block_number, e))
        })?;
        let mut tokens = tokens.into_iter();
        let (Some(body), Some(enc_key)) = (tokens.next(), tokens.next()) else {
            return Err(CoordinatorError::Decode("PublishMessage log is truncated".into()));
        };
        let mut body = expect_tuple(body, 2, "message")?.into_iter();
        let (Some(iv), Some(data)) = (body.next(), body.next()) else {
            return Err(CoordinatorError::Decode("message body is truncated".into()));
        };
        let mut message = Message::empty();
        message.iv = u256_to_fr(expect_uint(iv, "message iv")?)?;
        for (slot, token) in message
            .data
            .iter_mut()
            .zip(expect_tuple(data, MESSAGE_DATA_LENGTH, "message data")?)
        {
            *slot = u256_to_fr(expect_uint(token, "message data")?)?;
        }
        message.enc_pub_key = decode_point(enc_key, "encryption public key")?;
        return Ok(PollEvent::PublishMessage(message));
    }

    Err(CoordinatorError::Decode(format!(
        "unexpected log topic 0x{} at block {}",
        hex::encode(log.topic0),
        log.block_number
    )))
}

fn chain_io<E: std::fmt::Display>(err: E) -> CoordinatorError {
    CoordinatorError::ChainIo(err.to_string())
}

async fn eth_call<M: Middleware>(
    client: &M,
    to: Address,
    signature: &str,
    args: &[Token],
    outputs: &[ParamType],
) -> CoordinatorResult<Vec<Token>> {
    let mut calldata = ethers::utils::id(signature).to_vec();
    calldata.extend_from_slice(&ethers::abi::encode(args));
    let tx: TypedTransaction = TransactionRequest::new()
        .to(to)
        .data(Bytes::from(calldata))
        .into();
    let raw = client.call(&tx, None).await.map_err(chain_io)?;
    ethers::abi::decode(outputs, &raw)
        .map_err(|e| CoordinatorError::Decode(format!("{}: {}", signature, e)))
}

async fn call_uint<M: Middleware>(client: &M, to: Address, signature: &str) -> CoordinatorResult<U256> {
    let tokens = eth_call(client, to, signature, &[], &[ParamType::Uint(256)]).await?;
    tokens
        .into_iter()
        .next()
        .map(|t| expect_uint(t, signature))
        .unwrap_or_else(|| Err(CoordinatorError::Decode(format!("{} returned nothing", signature))))
}

fn parse_address(raw: &str) -> CoordinatorResult<Address> {
    raw.parse::<Address>()
        .map_err(|e| CoordinatorError::Config(format!("invalid contract address '{}': {}", raw, e)))
}

/// JSON-RPC view of a deployed poll.
pub struct EthersPoll {
    provider: Arc<Provider<Http>>,
    address: Address,
}

impl EthersPoll {
    /// Connect and make sure a contract is deployed at `address`.
    pub async fn connect(rpc_url: &str, address: &str) -> CoordinatorResult<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| CoordinatorError::Config(format!("invalid rpc url '{}': {}", rpc_url, e)))?;
        let address = parse_address(address)?;

        let code = provider.get_code(address, None).await.map_err(chain_io)?;
        if code.as_ref().is_empty() {
            return Err(CoordinatorError::Precondition(format!(
                "Poll {:?} not found",
                address
            )));
        }
        info!("Connected to poll at {:?}", address);

        Ok(Self {
            provider: Arc::new(provider),
            address,
        })
    }

    async fn message_aq_address(&self) -> CoordinatorResult<Address> {
        let tokens = eth_call(
            self.provider.as_ref(),
            self.address,
            "extContracts()",
            &[],
            &[ParamType::Address, ParamType::Address, ParamType::Address],
        )
        .await?;
        tokens
            .into_iter()
            .nth(1)
            .and_then(Token::into_address)
            .ok_or_else(|| CoordinatorError::Decode("extContracts() has no message queue".into()))
    }
}

#[async_trait]
impl PollEndpoint for EthersPoll {
    async fn poll_id(&self) -> CoordinatorResult<u64> {
        let id = call_uint(self.provider.as_ref(), self.address, "pollId()").await?;
        u256_to_u64(id, "poll id")
    }

    async fn num_signups(&self) -> CoordinatorResult<u64> {
        let tokens = eth_call(
            self.provider.as_ref(),
            self.address,
            "numSignUpsAndMessages()",
            &[],
            &[ParamType::Uint(256), ParamType::Uint(256)],
        )
        .await?;
        let first = tokens
            .into_iter()
            .next()
            .ok_or_else(|| CoordinatorError::Decode("numSignUpsAndMessages() is empty".into()))?;
        u256_to_u64(expect_uint(first, "signups")?, "signups")
    }

    async fn num_messages(&self) -> CoordinatorResult<u64> {
        let tokens = eth_call(
            self.provider.as_ref(),
            self.address,
            "numSignUpsAndMessages()",
            &[],
            &[ParamType::Uint(256), ParamType::Uint(256)],
        )
        .await?;
        let second = tokens
            .into_iter()
            .nth(1)
            .ok_or_else(|| CoordinatorError::Decode("numSignUpsAndMessages() is empty".into()))?;
        u256_to_u64(expect_uint(second, "messages")?, "messages")
    }

    async fn state_aq_merged(&self) -> CoordinatorResult<bool> {
        let tokens = eth_call(
            self.provider.as_ref(),
            self.address,
            "stateAqMerged()",
            &[],
            &[ParamType::Bool],
        )
        .await?;
        tokens
            .into_iter()
            .next()
            .and_then(Token::into_bool)
            .ok_or_else(|| CoordinatorError::Decode("stateAqMerged() is not a bool".into()))
    }

    async fn merged_state_root(&self) -> CoordinatorResult<Fr> {
        u256_to_fr(call_uint(self.provider.as_ref(), self.address, "mergedStateRoot()").await?)
    }

    async fn tree_depths(&self) -> CoordinatorResult<TreeDepths> {
        let tokens = eth_call(
            self.provider.as_ref(),
            self.address,
            "treeDepths()",
            &[],
            &[
                ParamType::Uint(8),
                ParamType::Uint(8),
                ParamType::Uint(8),
                ParamType::Uint(8),
            ],
        )
        .await?;
        let mut depths = Vec::with_capacity(4);
        for token in tokens {
            depths.push(u256_to_u64(expect_uint(token, "tree depth")?, "tree depth")? as usize);
        }
        let state_tree_depth = call_uint(self.provider.as_ref(), self.address, "stateTreeDepth()")
            .await
            .and_then(|depth| u256_to_u64(depth, "state tree depth"))?
            as usize;
        match depths.as_slice() {
            [int_state, message_sub, message, vote_option] => Ok(TreeDepths {
                state_tree_depth,
                int_state_tree_depth: *int_state,
                message_tree_sub_depth: *message_sub,
                message_tree_depth: *message,
                vote_option_tree_depth: *vote_option,
            }),
            _ => Err(CoordinatorError::Decode("treeDepths() has unexpected shape".into())),
        }
    }

    async fn message_aq_main_root(&self, depth: usize) -> CoordinatorResult<Fr> {
        let aq = self.message_aq_address().await?;
        let tokens = eth_call(
            self.provider.as_ref(),
            aq,
            "getMainRoot(uint256)",
            &[Token::Uint(U256::from(depth))],
            &[ParamType::Uint(256)],
        )
        .await?;
        let root = tokens
            .into_iter()
            .next()
            .ok_or_else(|| CoordinatorError::Decode("getMainRoot() is empty".into()))?;
        u256_to_fr(expect_uint(root, "message root")?)
    }

    async fn max_values(&self) -> CoordinatorResult<MaxValues> {
        let tokens = eth_call(
            self.provider.as_ref(),
            self.address,
            "maxValues()",
            &[],
            &[ParamType::Uint(256), ParamType::Uint(256)],
        )
        .await?;
        let mut values = tokens.into_iter();
        let (Some(messages), Some(options)) = (values.next(), values.next()) else {
            return Err(CoordinatorError::Decode("maxValues() is truncated".into()));
        };
        Ok(MaxValues {
            max_messages: u256_to_u64(expect_uint(messages, "max messages")?, "max messages")?,
            max_vote_options: u256_to_u64(
                expect_uint(options, "max vote options")?,
                "max vote options",
            )?,
        })
    }

    async fn coordinator_pub_key(&self) -> CoordinatorResult<PubKey> {
        let tokens = eth_call(
            self.provider.as_ref(),
            self.address,
            "coordinatorPubKey()",
            &[],
            &[ParamType::Uint(256), ParamType::Uint(256)],
        )
        .await?;
        let (x, y) = decode_point(Token::Tuple(tokens), "coordinator public key")?;
        PubKey::from_xy(x, y).map_err(|e| CoordinatorError::Decode(e.to_string()))
    }

    async fn deploy_time_and_duration(&self) -> CoordinatorResult<(u64, u64)> {
        let tokens = eth_call(
            self.provider.as_ref(),
            self.address,
            "getDeployTimeAndDuration()",
            &[],
            &[ParamType::Uint(256), ParamType::Uint(256)],
        )
        .await?;
        let mut values = tokens.into_iter();
        let (Some(deploy), Some(duration)) = (values.next(), values.next()) else {
            return Err(CoordinatorError::Decode("getDeployTimeAndDuration() is truncated".into()));
        };
        Ok((
            u256_to_u64(expect_uint(deploy, "deploy time")?, "deploy time")?,
            u256_to_u64(expect_uint(duration, "duration")?, "duration")?,
        ))
    }

    async fn block_number(&self) -> CoordinatorResult<u64> {
        let block = self.provider.get_block_number().await.map_err(chain_io)?;
        Ok(block.as_u64())
    }

    async fn fetch_logs(&self, from_block: u64, to_block: u64) -> CoordinatorResult<Vec<RawLog>> {
        let filter = Filter::new()
            .address(self.address)
            .from_block(from_block)
            .to_block(to_block)
            .events(vec![SIGN_UP_EVENT, PUBLISH_MESSAGE_EVENT]);

        debug!("Fetching poll logs for blocks {}..={}", from_block, to_block);
        let logs = self.provider.get_logs(&filter).await.map_err(chain_io)?;

        logs.into_iter()
            .map(|log| -> CoordinatorResult<RawLog> {
                let missing = |what: &str| {
                    CoordinatorError::Decode(format!(
                        "log in blocks {}..={} has no {}",
                        from_block, to_block, what
                    ))
                };
                Ok(RawLog {
                    block_number: log.block_number.ok_or_else(|| missing("block number"))?.as_u64(),
                    transaction_index: log
                        .transaction_index
                        .ok_or_else(|| missing("transaction index"))?
                        .as_u64(),
                    log_index: log.log_index.ok_or_else(|| missing("log index"))?.as_u64(),
                    topic0: log.topics.first().ok_or_else(|| missing("topic"))?.0,
                    data: log.data.to_vec(),
                })
            })
            .collect()
    }
}

/// Signs and sends replay transactions.
pub struct EthersPollWriter {
    client: Arc<SignerMiddleware<Provider<Http>, LocalWallet>>,
    address: Address,
}

impl EthersPollWriter {
    pub async fn connect(rpc_url: &str, address: &str, private_key: &str) -> CoordinatorResult<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| CoordinatorError::Config(format!("invalid rpc url '{}': {}", rpc_url, e)))?;
        let wallet = private_key
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|_| CoordinatorError::Config("invalid signer private key".into()))?;

        let chain_id = provider.get_chainid().await.map_err(chain_io)?;
        let wallet = wallet.with_chain_id(chain_id.as_u64());
        let address = parse_address(address)?;

        let code = provider.get_code(address, None).await.map_err(chain_io)?;
        if code.as_ref().is_empty() {
            return Err(CoordinatorError::Precondition(
                "there is no contract deployed at the specified address".into(),
            ));
        }

        Ok(Self {
            client: Arc::new(SignerMiddleware::new(provider, wallet)),
            address,
        })
    }

    async fn send(&self, signature: &str, args: &[Token], gas: u64) -> CoordinatorResult<()> {
        let mut calldata = ethers::utils::id(signature).to_vec();
        calldata.extend_from_slice(&ethers::abi::encode(args));
        let tx = TransactionRequest::new()
            .to(self.address)
            .data(Bytes::from(calldata))
            .gas(gas);

        let pending = self.client.send_transaction(tx, None).await.map_err(chain_io)?;
        let tx_hash = pending.tx_hash();
        debug!("Sent {} in {:?}", signature, tx_hash);

        let receipt = pending.await.map_err(chain_io)?;
        match receipt {
            Some(receipt) if receipt.status == Some(U64::from(1)) => Ok(()),
            Some(_) => Err(CoordinatorError::ChainIo(format!(
                "{} reverted in {:?}",
                signature, tx_hash
            ))),
            None => Err(CoordinatorError::ChainIo(format!(
                "{} was dropped from the mempool",
                signature
            ))),
        }
    }
}

#[async_trait]
impl PollWriter for EthersPollWriter {
    async fn num_signups(&self) -> CoordinatorResult<u64> {
        let value = call_uint(self.client.as_ref(), self.address, "numSignUps()").await?;
        u256_to_u64(value, "signups")
    }

    async fn num_messages(&self) -> CoordinatorResult<u64> {
        let value = call_uint(self.client.as_ref(), self.address, "numMessages()").await?;
        u256_to_u64(value, "messages")
    }

    async fn sign_up(&self, pub_key: &PubKey, voice_credit_balance: u64) -> CoordinatorResult<()> {
        let gatekeeper_data = vec![0u8; 32];
        let credit_data = ethers::abi::encode(&[Token::Uint(U256::from(voice_credit_balance))]);
        self.send(
            "signUp((uint256,uint256),bytes,bytes)",
            &[
                point_tokens(pub_key.xy()),
                Token::Bytes(gatekeeper_data),
                Token::Bytes(credit_data),
            ],
            2_000_000,
        )
        .await
    }

    async fn publish_message(&self, message: &Message) -> CoordinatorResult<()> {
        self.send(
            "publishMessage((uint256,uint256[10]),(uint256,uint256))",
            &[message_tokens(message), point_tokens(message.enc_pub_key)],
            1_000_000,
        )
        .await
    }

    async fn state_root(&self) -> CoordinatorResult<Fr> {
        u256_to_fr(call_uint(self.client.as_ref(), self.address, "getStateTreeRoot()").await?)
    }

    async fn message_root(&self) -> CoordinatorResult<Fr> {
        u256_to_fr(call_uint(self.client.as_ref(), self.address, "getMessageTreeRoot()").await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maci_common::Keypair;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn raw(topic0: [u8; 32], data: Vec<u8>) -> RawLog {
        RawLog {
            block_number: 10,
            transaction_index: 0,
            log_index: 0,
            topic0,
            data,
        }
    }

    #[test]
    fn decodes_sign_up_logs() {
        let mut rng = StdRng::seed_from_u64(11);
        let user = Keypair::random(&mut rng);
        let log = raw(sign_up_topic(), encode_sign_up(1, &user.pub_key, 100, 1_700_000_000));
        assert_eq!(
            decode_log(&log).unwrap(),
            PollEvent::SignUp {
                state_index: 1,
                pub_key: user.pub_key,
                voice_credit_balance: 100,
                timestamp: 1_700_000_000,
            }
        );
    }

    #[test]
    fn decodes_publish_message_logs() {
        let mut rng = StdRng::seed_from_u64(12);
        let key = Keypair::random(&mut rng);
        let mut message = Message::empty();
        message.iv = Fr::from(9u64);
        message.data[3] = Fr::from(33u64);
        message.enc_pub_key = key.pub_key.xy();
        let log = raw(publish_message_topic(), encode_publish_message(&message));
        assert_eq!(decode_log(&log).unwrap(), PollEvent::PublishMessage(message));
    }

    #[test]
    fn malformed_logs_are_decode_errors() {
        let truncated = raw(publish_message_topic(), vec![0u8; 64]);
        assert_eq!(decode_log(&truncated).unwrap_err().error_code(), "DECODE_ERROR");

        let unknown = raw([7u8; 32], vec![]);
        assert!(matches!(decode_log(&unknown), Err(CoordinatorError::Decode(_))));
    }

    #[test]
    fn field_overflow_is_rejected() {
        assert!(u256_to_fr(U256::MAX).is_err());
        let value = Fr::from(123u64);
        assert_eq!(u256_to_fr(fr_to_u256(&value)).unwrap(), value);
    }
}
